use axum::http::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::models::ProviderConfig;

pub const HEADER_BASE_URL: &str = "x-ai-base-url";
pub const HEADER_API_KEY: &str = "x-ai-api-key";
pub const HEADER_MODEL_ID: &str = "x-ai-model-id";

/**
 * \brief 从请求头解析模型服务配置。
 * \details 缺少 base URL / 模型，或 base URL 不是绝对地址时返回 None（而非报错）；
 *          API Key 缺省为空串，以兼容本地模型。
 */
pub fn resolve_provider_config(headers: &HeaderMap) -> Option<ProviderConfig> {
    let base_url = header_str(headers, HEADER_BASE_URL)?;
    let model_id = header_str(headers, HEADER_MODEL_ID)?;
    let api_key = header_str(headers, HEADER_API_KEY).unwrap_or_default();

    let config = ProviderConfig {
        base_url,
        api_key,
        model_id,
    };
    is_valid(&config).then_some(config)
}

/**
 * \brief 判断配置是否合法：base URL 为绝对 URL，模型标识非空。
 * \details 各字段须已去除首尾空白且只含可见 ASCII，保证经请求头往返后原样还原。
 */
pub fn is_valid(config: &ProviderConfig) -> bool {
    [&config.base_url, &config.api_key, &config.model_id]
        .into_iter()
        .all(|v| header_safe(v))
        && !config.model_id.is_empty()
        && Url::parse(&config.base_url).is_ok()
}

fn header_safe(value: &str) -> bool {
    value == value.trim() && value.bytes().all(|b| b == b' ' || b.is_ascii_graphic())
}

/**
 * \brief 将配置编码为请求头，供客户端发起 AI 请求使用。
 */
pub fn provider_headers(config: &ProviderConfig) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static(HEADER_BASE_URL),
        HeaderValue::from_str(&config.base_url)?,
    );
    headers.insert(
        HeaderName::from_static(HEADER_MODEL_ID),
        HeaderValue::from_str(&config.model_id)?,
    );
    if !config.api_key.is_empty() {
        headers.insert(
            HeaderName::from_static(HEADER_API_KEY),
            HeaderValue::from_str(&config.api_key)?,
        );
    }
    Ok(headers)
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(name)?.to_str().ok()?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
