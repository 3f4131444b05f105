//! 错误分类：把 HTTP 状态码、网络异常与各种响应体统一映射为可恢复错误信封。

use serde::{Deserialize, Serialize};

/**
 * \brief 封闭的错误类型集合。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Auth,
    ModelNotFound,
    RateLimit,
    Timeout,
    ProviderUnavailable,
    ServerError,
    Network,
    FormatIncompatible,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    Retry,
    SwitchModel,
    CheckConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl ErrorType {
    /**
     * \brief 固定的严重度表。
     */
    pub fn severity(self) -> Severity {
        match self {
            ErrorType::Auth | ErrorType::ModelNotFound | ErrorType::FormatIncompatible => {
                Severity::High
            }
            ErrorType::RateLimit | ErrorType::Timeout | ErrorType::ServerError => Severity::Low,
            _ => Severity::Medium,
        }
    }

    /**
     * \brief 默认可重试性，上游结构化信封可覆盖。
     */
    pub fn default_retriable(self) -> bool {
        !matches!(
            self,
            ErrorType::Auth | ErrorType::ModelNotFound | ErrorType::FormatIncompatible
        )
    }

    pub fn default_actions(self) -> Vec<SuggestedAction> {
        use SuggestedAction::*;
        match self {
            ErrorType::Auth => vec![CheckConfig, SwitchModel],
            ErrorType::ModelNotFound => vec![SwitchModel, CheckConfig],
            ErrorType::RateLimit | ErrorType::Timeout | ErrorType::ServerError => {
                vec![Retry, SwitchModel]
            }
            ErrorType::ProviderUnavailable => vec![SwitchModel, CheckConfig],
            ErrorType::FormatIncompatible => vec![SwitchModel],
            ErrorType::Network | ErrorType::Unknown => vec![Retry, CheckConfig],
        }
    }
}

/**
 * \brief 结构化错误分类结果，每次失败生成新值，从不原地修改。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorClassification {
    pub error_type: ErrorType,
    pub message: String,
    pub retriable: bool,
    pub suggested_actions: Vec<SuggestedAction>,
    pub severity: Severity,
}

impl ErrorClassification {
    /**
     * \brief 按错误类型的默认表构造分类。
     */
    pub fn from_type(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            retriable: error_type.default_retriable(),
            suggested_actions: error_type.default_actions(),
            severity: error_type.severity(),
        }
    }

    /**
     * \brief 转换为线上信封。
     */
    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: self.message.clone(),
            error_type: self.error_type,
            retriable: self.retriable,
            suggested_actions: self.suggested_actions.clone(),
        }
    }
}

/**
 * \brief 服务端与客户端之间的结构化错误信封。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub error: String,
    pub error_type: ErrorType,
    pub retriable: bool,
    pub suggested_actions: Vec<SuggestedAction>,
}

/**
 * \brief 调用场景，仅影响提示文案（404 除外）。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorContext {
    TestConnection,
    ListModels,
    Completion,
}

impl ErrorContext {
    fn generic_message(self, status: u16) -> String {
        match self {
            ErrorContext::TestConnection => format!("连接测试失败（HTTP {}）", status),
            ErrorContext::ListModels => format!("获取模型列表失败（HTTP {}）", status),
            ErrorContext::Completion => format!("AI 生成请求失败（HTTP {}）", status),
        }
    }
}

/**
 * \brief 按状态码分类 HTTP 错误。
 */
pub fn classify_http_error(status: u16, context: ErrorContext) -> ErrorClassification {
    match status {
        401 | 403 => ErrorClassification::from_type(
            ErrorType::Auth,
            "API Key 无效或无权访问，请检查模型服务配置",
        ),
        404 if context == ErrorContext::ListModels => ErrorClassification::from_type(
            ErrorType::ProviderUnavailable,
            "该服务不提供模型列表接口，请确认 Base URL 是否正确",
        ),
        404 => ErrorClassification::from_type(
            ErrorType::ModelNotFound,
            "找不到指定的模型或接口，请确认模型 ID 与 Base URL",
        ),
        429 => ErrorClassification::from_type(ErrorType::RateLimit, "请求过于频繁，请稍后重试"),
        s if s >= 500 => ErrorClassification::from_type(
            ErrorType::ServerError,
            format!("模型服务暂时不可用（HTTP {}）", s),
        ),
        s => ErrorClassification::from_type(ErrorType::Unknown, context.generic_message(s)),
    }
}

/**
 * \brief 按异常文本分类网络错误。
 */
pub fn classify_network_error(err: &str) -> ErrorClassification {
    let lower = err.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") || lower.contains("abort") {
        ErrorClassification::from_type(ErrorType::Timeout, "请求超时，请稍后重试或更换模型")
    } else if ["econnrefused", "enotfound", "fetch failed", "failed to fetch", "networkerror"]
        .iter()
        .any(|p| lower.contains(p))
        || lower.contains("error sending request")
        || lower.contains("connection refused")
        || lower.contains("dns error")
    {
        ErrorClassification::from_type(ErrorType::Network, "无法连接到模型服务，请检查网络或 Base URL")
    } else {
        ErrorClassification::from_type(ErrorType::Unknown, format!("未知错误：{}", err))
    }
}

/**
 * \brief 客户端发起请求时抛出的错误。
 */
pub fn parse_fetch_error(err: &reqwest::Error) -> ErrorClassification {
    if err.is_timeout() {
        return ErrorClassification::from_type(ErrorType::Timeout, "请求超时，请稍后重试或更换模型");
    }
    if err.is_connect() {
        return ErrorClassification::from_type(
            ErrorType::Network,
            "无法连接到模型服务，请检查网络或 Base URL",
        );
    }
    classify_network_error(&err.to_string())
}

/**
 * \brief 响应体解析的三种结果：严格信封、旧格式、无法识别。
 */
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedErrorBody {
    Structured(ErrorEnvelope),
    Legacy { error: String },
    Unrecognized,
}

#[derive(Deserialize)]
struct LegacyBody {
    error: String,
}

impl ParsedErrorBody {
    pub fn parse(body: &str) -> Self {
        if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
            return ParsedErrorBody::Structured(envelope);
        }
        if let Ok(legacy) = serde_json::from_str::<LegacyBody>(body) {
            return ParsedErrorBody::Legacy {
                error: legacy.error,
            };
        }
        ParsedErrorBody::Unrecognized
    }
}

/**
 * \brief 解析失败响应，永不报错。
 */
pub fn parse_ai_error(status: u16, body: &str) -> ErrorClassification {
    match ParsedErrorBody::parse(body) {
        ParsedErrorBody::Structured(envelope) => ErrorClassification {
            severity: envelope.error_type.severity(),
            error_type: envelope.error_type,
            message: envelope.error,
            retriable: envelope.retriable,
            suggested_actions: envelope.suggested_actions,
        },
        ParsedErrorBody::Legacy { error } => {
            let error_type = infer_error_type(status, &error);
            let mut suggested_actions = vec![SuggestedAction::Retry, SuggestedAction::CheckConfig];
            // 认证失败或模型不存在时补充切换模型
            if matches!(error_type, ErrorType::Auth | ErrorType::ModelNotFound) {
                suggested_actions.push(SuggestedAction::SwitchModel);
            }
            ErrorClassification {
                error_type,
                severity: error_type.severity(),
                message: error,
                retriable: status >= 500 || status == 429,
                suggested_actions,
            }
        }
        ParsedErrorBody::Unrecognized => fallback_classification(),
    }
}

/**
 * \brief 响应体无法识别时的固定兜底分类。
 */
pub fn fallback_classification() -> ErrorClassification {
    ErrorClassification {
        error_type: ErrorType::Unknown,
        message: "AI 服务返回了无法识别的错误，请稍后重试".to_string(),
        retriable: true,
        suggested_actions: vec![SuggestedAction::Retry, SuggestedAction::CheckConfig],
        severity: Severity::Medium,
    }
}

fn infer_error_type(status: u16, message: &str) -> ErrorType {
    let lower = message.to_lowercase();
    match status {
        401 | 403 => return ErrorType::Auth,
        404 => return ErrorType::ModelNotFound,
        429 => return ErrorType::RateLimit,
        _ => {}
    }
    if lower.contains("timeout") || lower.contains("timed out") {
        ErrorType::Timeout
    } else if lower.contains("api key") || lower.contains("unauthorized") {
        ErrorType::Auth
    } else if lower.contains("rate limit") {
        ErrorType::RateLimit
    } else if lower.contains("model") && lower.contains("not found") {
        ErrorType::ModelNotFound
    } else if lower.contains("network") || lower.contains("econnrefused") {
        ErrorType::Network
    } else if status >= 500 {
        ErrorType::ServerError
    } else {
        ErrorType::Unknown
    }
}
