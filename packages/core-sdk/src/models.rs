use serde::{Deserialize, Serialize};

/**
 * \brief 模型服务配置（自带密钥）：来自请求头，服务端从不持久化。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /** \brief API 基地址，必须为绝对 URL */
    pub base_url: String,
    /** \brief API 密钥，本地模型可为空 */
    #[serde(default)]
    pub api_key: String,
    /** \brief 模型标识 */
    pub model_id: String,
}

impl ProviderConfig {
    /**
     * \brief 在当前配置之上叠加一次性覆盖，返回新对象，原配置不变。
     * \details 覆盖值去除首尾空白；空的 base URL 覆盖视为未提供。
     */
    pub fn with_override(&self, temp: &TemporaryConfig) -> ProviderConfig {
        ProviderConfig {
            base_url: temp
                .base_url
                .as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .unwrap_or(&self.base_url)
                .to_string(),
            api_key: self.api_key.clone(),
            model_id: temp.model_id.trim().to_string(),
        }
    }
}

/**
 * \brief 仅用于一次重试的临时覆盖，用后即弃。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporaryConfig {
    pub model_id: String,
    pub base_url: Option<String>,
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：system/user/assistant */
    pub role: String,
    /** \brief 内容 */
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/**
 * \brief 故事圣经字段，全部可选；空字段在拼装上下文时跳过。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BibleFields {
    pub braindump: Option<String>,
    pub genre: Option<String>,
    pub style: Option<String>,
    pub synopsis: Option<String>,
    pub setting: Option<String>,
    pub worldbuilding: Option<String>,
    pub outline: Option<String>,
    pub pov: Option<String>,
    pub tense: Option<String>,
    pub style_sample: Option<String>,
    pub prose_mode: Option<String>,
}

/**
 * \brief 角色摘要。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterSummary {
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/**
 * \brief 单次请求内组装的只读故事上下文。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoryContext {
    pub bible: Option<BibleFields>,
    pub characters: Vec<CharacterSummary>,
}

/**
 * \brief 一次完成（或中断）的流式生成对应的遥测记录，只追加不修改。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub user_id: String,
    pub project_id: String,
    pub document_id: Option<String>,
    pub feature: String,
    pub prompt: String,
    pub result: String,
    pub model: String,
    pub tokens_used: i64,
    pub latency_ms: i64,
    pub output_chars: i64,
    pub response_fingerprint: String,
}

/**
 * \brief 当前文本窗口中活跃的角色、地点与情节线。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaliencyMap {
    pub active_characters: Vec<String>,
    pub active_locations: Vec<String>,
    pub active_plotlines: Vec<String>,
}
