use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::{classify::ErrorClassification, telemetry::truncate_chars};

const UPSTREAM_BODY_PREVIEW_CHARS: usize = 500;

/**
 * \brief AI 请求链路上的错误。
 * \details 网络调用之前的失败返回普通 JSON；上游调用中的失败一律转换为结构化信封。
 */
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("AI 服务未配置，请先填写 Base URL 与模型")]
    NotConfigured,

    #[error("缺少用户身份")]
    Unauthenticated,

    #[error("{0}")]
    BadRequest(String),

    #[error("AI 服务配置缺失，无法发起请求")]
    Misconfigured,

    #[error("upstream returned {status}: {body}")]
    Upstream {
        status: u16,
        body: String,
        classification: ErrorClassification,
    },

    #[error("{}", .0.message)]
    Transport(ErrorClassification),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::NotConfigured | ProxyError::BadRequest(_) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": self.to_string() })))
                    .into_response()
            }
            ProxyError::Unauthenticated => {
                (StatusCode::UNAUTHORIZED, Json(json!({ "error": self.to_string() })))
                    .into_response()
            }
            ProxyError::Misconfigured => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": self.to_string() })),
            )
                .into_response(),
            ProxyError::Upstream {
                body,
                classification,
                ..
            } => {
                let mut envelope = classification.to_envelope();
                if !body.trim().is_empty() {
                    envelope.error = format!(
                        "{}（上游返回：{}）",
                        envelope.error,
                        truncate_chars(body.trim(), UPSTREAM_BODY_PREVIEW_CHARS)
                    );
                }
                (StatusCode::INTERNAL_SERVER_ERROR, Json(envelope)).into_response()
            }
            ProxyError::Transport(classification) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(classification.to_envelope()),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{classify_http_error, parse_ai_error, ErrorContext, ErrorType};

    async fn body_of(resp: Response) -> (StatusCode, String) {
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[tokio::test]
    async fn test_pre_network_errors_are_plain_json() {
        let (status, body) = body_of(ProxyError::NotConfigured.into_response()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let v: serde_json::Value = serde_json::from_str(&body).expect("json");
        assert!(v.get("errorType").is_none());
        assert!(v["error"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_upstream_error_round_trips_through_client_parser() {
        let err = ProxyError::Upstream {
            status: 429,
            body: "{\"error\":{\"message\":\"quota exceeded\"}}".to_string(),
            classification: classify_http_error(429, ErrorContext::Completion),
        };
        let (status, body) = body_of(err.into_response()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("quota exceeded"));

        let parsed = parse_ai_error(status.as_u16(), &body);
        assert_eq!(parsed.error_type, ErrorType::RateLimit);
        assert!(parsed.retriable);
    }
}
