use std::{future::Future, time::Duration};

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::{
    classify::{
        classify_http_error, classify_network_error, parse_fetch_error, ErrorClassification,
        ErrorContext, ErrorType,
    },
    error::ProxyError,
    models::{Message, ProviderConfig},
    sse::extract_openai_content,
};

/** \brief 连接测试与模型列表请求的超时。 */
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/**
 * \brief 一次补全请求的参数。
 */
#[derive(Debug, Clone)]
pub struct CompletionRequest<'a> {
    pub messages: &'a [Message],
    pub max_tokens: u32,
    pub temperature: f32,
    pub model: &'a str,
}

pub fn chat_completions_url(config: &ProviderConfig) -> String {
    format!("{}/chat/completions", config.base_url.trim_end_matches('/'))
}

pub fn models_url(config: &ProviderConfig) -> String {
    format!("{}/models", config.base_url.trim_end_matches('/'))
}

fn authorize(builder: reqwest::RequestBuilder, config: &ProviderConfig) -> reqwest::RequestBuilder {
    if config.api_key.is_empty() {
        builder
    } else {
        builder.header(AUTHORIZATION, format!("Bearer {}", config.api_key))
    }
}

/**
 * \brief 发起流式补全请求（stream=true）。
 * \details 上游返回非 2xx 时读取响应文本并归类，此时尚未产生任何输出。
 */
pub async fn start_completion(
    client: &reqwest::Client,
    config: &ProviderConfig,
    request: &CompletionRequest<'_>,
) -> Result<reqwest::Response, ProxyError> {
    let body = json!({
        "model": request.model,
        "messages": request.messages,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
        "stream": true
    });

    let resp = authorize(client.post(chat_completions_url(config)), config)
        .header(CONTENT_TYPE, "application/json")
        .json(&body)
        .send()
        .await
        .map_err(|e| ProxyError::Transport(parse_fetch_error(&e)))?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        return Err(ProxyError::Upstream {
            status,
            body: text,
            classification: classify_http_error(status, ErrorContext::Completion),
        });
    }
    Ok(resp)
}

/**
 * \brief 非流式调用，返回完整回复。
 */
pub async fn chat_once(
    client: &reqwest::Client,
    config: &ProviderConfig,
    messages: &[Message],
    max_tokens: u32,
    temperature: f32,
) -> Result<String, ErrorClassification> {
    let body = json!({
        "model": config.model_id,
        "messages": messages,
        "max_tokens": max_tokens,
        "temperature": temperature,
        "stream": false
    });

    let resp = authorize(client.post(chat_completions_url(config)), config)
        .header(CONTENT_TYPE, "application/json")
        .json(&body)
        .send()
        .await
        .map_err(|e| parse_fetch_error(&e))?;

    if !resp.status().is_success() {
        return Err(classify_http_error(
            resp.status().as_u16(),
            ErrorContext::Completion,
        ));
    }
    let v: Value = resp.json().await.map_err(|_| {
        ErrorClassification::from_type(ErrorType::FormatIncompatible, "模型返回的内容格式无法解析")
    })?;
    Ok(extract_openai_content(&v))
}

/**
 * \brief 列出模型，15 秒未完成或令牌被取消时中止。
 */
pub async fn list_models(
    client: &reqwest::Client,
    config: &ProviderConfig,
    token: &CancellationToken,
) -> Result<Vec<String>, ErrorClassification> {
    with_probe_timeout(
        token,
        PROBE_TIMEOUT,
        fetch_models(client, config, ErrorContext::ListModels),
    )
    .await
}

/**
 * \brief 连接测试：能取到模型列表即视为可用，返回模型数量。
 */
pub async fn test_connection(
    client: &reqwest::Client,
    config: &ProviderConfig,
    token: &CancellationToken,
) -> Result<usize, ErrorClassification> {
    with_probe_timeout(
        token,
        PROBE_TIMEOUT,
        fetch_models(client, config, ErrorContext::TestConnection),
    )
    .await
    .map(|models| models.len())
}

/**
 * \brief 为请求附加超时：超时后取消令牌，令牌被外部取消时同样中止。
 */
pub async fn with_probe_timeout<T, F>(
    token: &CancellationToken,
    timeout: Duration,
    fut: F,
) -> Result<T, ErrorClassification>
where
    F: Future<Output = Result<T, ErrorClassification>>,
{
    tokio::select! {
        res = fut => res,
        _ = token.cancelled() => Err(classify_network_error("request aborted")),
        _ = tokio::time::sleep(timeout) => {
            token.cancel();
            Err(classify_network_error("request timeout"))
        }
    }
}

async fn fetch_models(
    client: &reqwest::Client,
    config: &ProviderConfig,
    context: ErrorContext,
) -> Result<Vec<String>, ErrorClassification> {
    let resp = authorize(client.get(models_url(config)), config)
        .send()
        .await
        .map_err(|e| parse_fetch_error(&e))?;
    if !resp.status().is_success() {
        return Err(classify_http_error(resp.status().as_u16(), context));
    }
    let v: Value = resp.json().await.map_err(|_| {
        ErrorClassification::from_type(ErrorType::FormatIncompatible, "模型列表格式无法解析")
    })?;
    parse_model_list(&v).ok_or_else(|| {
        ErrorClassification::from_type(ErrorType::FormatIncompatible, "模型列表格式无法解析")
    })
}

fn parse_model_list(v: &Value) -> Option<Vec<String>> {
    let arr = v
        .get("data")
        .and_then(|x| x.as_array())
        .or_else(|| v.as_array())?;
    Some(
        arr.iter()
            .filter_map(|item| {
                item.get("id")
                    .and_then(|s| s.as_str())
                    .or_else(|| item.as_str())
            })
            .map(|s| s.to_string())
            .collect(),
    )
}
