//! 流式代理：把上游 SSE 解码为纯文本 token 流转发给调用方，结束时写入一条遥测记录。

use std::{convert::Infallible, fmt::Display, sync::Arc, time::Instant};

use axum::{
    body::Body,
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE},
        HeaderValue, StatusCode,
    },
    response::Response,
};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    db::StoryStore,
    error::ProxyError,
    llm::{self, CompletionRequest},
    models::{Message, ProviderConfig},
    sse::{map_line, Frame, SseLineDecoder},
    telemetry::{self, TelemetryContext},
};

pub const STREAM_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/**
 * \brief 流式补全请求。
 */
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f32,
    /** \brief 覆盖配置中的模型（可选） */
    pub model_id: Option<String>,
    pub provider_config: Option<ProviderConfig>,
}

/**
 * \brief 转发循环的结束方式。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEnd {
    Completed,
    ClientGone,
    UpstreamError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    /** \brief 实际累积并已转发的文本 */
    pub text: String,
    pub end: RelayEnd,
}

/**
 * \brief 创建流式响应。
 * \details 配置缺失时不发起任何网络请求；上游非 2xx 时返回结构化错误且不写遥测；
 *          开始转发后无论正常结束、上游中断还是调用方断开，都恰好写入一条遥测记录。
 */
pub async fn create_stream_response(
    client: &reqwest::Client,
    request: StreamRequest,
    telemetry_ctx: TelemetryContext,
    store: Arc<dyn StoryStore>,
) -> Result<Response, ProxyError> {
    let config = request.provider_config.ok_or(ProxyError::Misconfigured)?;
    let model = request
        .model_id
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| config.model_id.clone());

    let started = Instant::now();
    let upstream = llm::start_completion(
        client,
        &config,
        &CompletionRequest {
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            model: &model,
        },
    )
    .await
    .map_err(|e| {
        telemetry::log_error(
            "proxy.stream",
            &format!("feature={} model={} start failed: {}", telemetry_ctx.feature, model, e),
        );
        e
    })?;

    let (tx, rx) = mpsc::unbounded_channel::<Result<Bytes, Infallible>>();

    tokio::spawn(async move {
        let outcome = relay_stream(upstream.bytes_stream(), &tx).await;
        let latency_ms = started.elapsed().as_millis() as i64;
        match &outcome.end {
            RelayEnd::Completed => {}
            RelayEnd::ClientGone => telemetry::log_event(
                "proxy.stream",
                &format!("client disconnected feature={}", telemetry_ctx.feature),
            ),
            RelayEnd::UpstreamError(e) => telemetry::log_error(
                "proxy.stream",
                &format!("upstream interrupted feature={}: {}", telemetry_ctx.feature, e),
            ),
        }

        let feature = telemetry_ctx.feature.clone();
        let record = telemetry_ctx.into_record(&model, outcome.text, latency_ms);
        match store.insert_ai_history(&record) {
            Ok(id) => telemetry::log_event(
                "proxy.stream",
                &format!(
                    "history id={} feature={} model={} chars={} latency_ms={}",
                    id, feature, model, record.output_chars, latency_ms
                ),
            ),
            Err(e) => telemetry::log_error(
                "proxy.stream",
                &format!("history write failed feature={}: {}", feature, e),
            ),
        }
        // 遥测落库后才关闭输出流
        drop(tx);
    });

    let mut response = Response::new(Body::from_stream(UnboundedReceiverStream::new(rx)));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(STREAM_CONTENT_TYPE));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(response)
}

/**
 * \brief 顺序读取上游分片、解码、转发，返回累积文本与结束方式。
 * \details 调用方断开（接收端关闭）时停止读取上游。
 */
pub async fn relay_stream<S, E>(
    upstream: S,
    tx: &mpsc::UnboundedSender<Result<Bytes, Infallible>>,
) -> RelayOutcome
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    futures_util::pin_mut!(upstream);
    let mut decoder = SseLineDecoder::new();
    let mut text = String::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => {
                return RelayOutcome { text, end: RelayEnd::ClientGone };
            }
            next = upstream.next() => next,
        };
        match next {
            None => break,
            Some(Err(e)) => {
                return RelayOutcome {
                    text,
                    end: RelayEnd::UpstreamError(e.to_string()),
                };
            }
            Some(Ok(chunk)) => {
                for line in decoder.push(&chunk) {
                    if !forward_line(&line, &mut text, tx) {
                        return RelayOutcome {
                            text,
                            end: RelayEnd::ClientGone,
                        };
                    }
                }
            }
        }
    }

    if let Some(line) = decoder.finish() {
        if !forward_line(&line, &mut text, tx) {
            return RelayOutcome {
                text,
                end: RelayEnd::ClientGone,
            };
        }
    }
    RelayOutcome {
        text,
        end: RelayEnd::Completed,
    }
}

fn forward_line(
    line: &str,
    text: &mut String,
    tx: &mpsc::UnboundedSender<Result<Bytes, Infallible>>,
) -> bool {
    match map_line(line) {
        Frame::Delta(delta) => {
            text.push_str(&delta);
            tx.send(Ok(Bytes::from(delta))).is_ok()
        }
        Frame::Done | Frame::Ignored => true,
    }
}
