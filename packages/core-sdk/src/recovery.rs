//! 客户端恢复控制器：记住最近一次失败的请求，支持原样重试或临时切换模型后重放。

use std::{fmt, pin::Pin, sync::Arc};

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::watch;

use crate::{
    classify::{
        parse_ai_error, parse_fetch_error, ErrorClassification, ErrorType, SuggestedAction,
    },
    config::provider_headers,
    models::{ProviderConfig, TemporaryConfig},
    telemetry,
};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>;

/**
 * \brief 请求成功后接收响应体的回调；可能被多次重放调用。
 */
pub type SuccessHandler = Arc<dyn Fn(ByteStream) + Send + Sync>;

/**
 * \brief 传输层响应。
 */
pub struct TransportResponse {
    pub status: u16,
    pub body: ByteStream,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /**
     * \brief 读取全部响应文本；读取中断时返回已读部分。
     */
    pub async fn text(self) -> String {
        let mut buf = Vec::new();
        let mut body = self.body;
        while let Some(Ok(chunk)) = body.next().await {
            buf.extend_from_slice(&chunk);
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

/**
 * \brief 重放请求所用的传输层；网络异常在实现内部经 `parse_fetch_error` 归类。
 */
#[async_trait]
pub trait RecoveryTransport: Send + Sync {
    async fn post_json(
        &self,
        endpoint: &str,
        headers: HeaderMap,
        body: &Value,
    ) -> Result<TransportResponse, ErrorClassification>;
}

/**
 * \brief 基于 reqwest 的传输实现。
 */
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    user_id: Option<String>,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            user_id,
        }
    }

    fn url_for(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!(
                "{}/{}",
                self.base_url.trim_end_matches('/'),
                endpoint.trim_start_matches('/')
            )
        }
    }
}

#[async_trait]
impl RecoveryTransport for HttpTransport {
    async fn post_json(
        &self,
        endpoint: &str,
        mut headers: HeaderMap,
        body: &Value,
    ) -> Result<TransportResponse, ErrorClassification> {
        if let Some(user) = &self.user_id {
            if let Ok(v) = HeaderValue::from_str(user) {
                headers.insert(HeaderName::from_static("x-user-id"), v);
            }
        }
        let resp = self
            .client
            .post(self.url_for(endpoint))
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(|e| parse_fetch_error(&e))?;
        let status = resp.status().as_u16();
        let body = async_stream::stream! {
            let mut resp = resp;
            loop {
                match resp.chunk().await {
                    Ok(Some(chunk)) => yield Ok(chunk),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e.to_string());
                        break;
                    }
                }
            }
        };
        Ok(TransportResponse {
            status,
            body: Box::pin(body),
        })
    }
}

/**
 * \brief 被记住、可重放的请求。
 */
#[derive(Clone)]
pub struct RequestContext {
    pub endpoint: String,
    pub body: Value,
    on_success: SuccessHandler,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("endpoint", &self.endpoint)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

/**
 * \brief 控制器内部状态：正在重试时必然持有请求上下文，并保留触发重试的错误。
 */
#[derive(Debug, Clone)]
pub enum RecoveryPhase {
    Idle {
        context: Option<RequestContext>,
    },
    Failed {
        error: ErrorClassification,
        context: Option<RequestContext>,
    },
    Retrying {
        context: RequestContext,
        last_error: Option<ErrorClassification>,
    },
}

/**
 * \brief 对 UI 暴露的两字段视图。
 */
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryState {
    pub error: Option<ErrorClassification>,
    pub is_retrying: bool,
}

impl RecoveryState {
    /** \brief 有错误即可关闭提示。 */
    pub fn offers_dismiss(&self) -> bool {
        self.error.is_some()
    }

    /** \brief 可重试错误才提供“重试”。 */
    pub fn offers_retry(&self) -> bool {
        !self.is_retrying && self.error.as_ref().is_some_and(|e| e.retriable)
    }

    /** \brief 建议中包含切换模型时提供“切换模型”。 */
    pub fn offers_switch(&self) -> bool {
        !self.is_retrying
            && self
                .error
                .as_ref()
                .is_some_and(|e| e.suggested_actions.contains(&SuggestedAction::SwitchModel))
    }
}

/**
 * \brief 一次重试/切换的结果。
 */
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /** \brief 没有可重放的请求或配置，未做任何事 */
    Skipped,
    /** \brief 成功；切换模型时附带一次性提示 */
    Recovered { notice: Option<String> },
    Failed(ErrorClassification),
}

#[derive(Debug, Clone, Copy)]
enum RecoveryKind<'a> {
    Retry,
    Switch { model_id: &'a str },
}

/**
 * \brief 恢复控制器。
 * \details `handle_retry`/`handle_switch_model` 需要 `&mut self`，同一时刻至多一个重放在途；
 *          UI 可通过 `subscribe` 观察 `is_retrying` 以禁用按钮。
 */
pub struct RecoveryController<T: RecoveryTransport> {
    transport: T,
    phase: RecoveryPhase,
    state_tx: watch::Sender<RecoveryState>,
}

impl<T: RecoveryTransport> RecoveryController<T> {
    pub fn new(transport: T) -> Self {
        let (state_tx, _) = watch::channel(RecoveryState::default());
        Self {
            transport,
            phase: RecoveryPhase::Idle { context: None },
            state_tx,
        }
    }

    pub fn phase(&self) -> &RecoveryPhase {
        &self.phase
    }

    pub fn state(&self) -> RecoveryState {
        match &self.phase {
            RecoveryPhase::Idle { .. } => RecoveryState::default(),
            RecoveryPhase::Failed { error, .. } => RecoveryState {
                error: Some(error.clone()),
                is_retrying: false,
            },
            RecoveryPhase::Retrying { last_error, .. } => RecoveryState {
                error: last_error.clone(),
                is_retrying: true,
            },
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<RecoveryState> {
        self.state_tx.subscribe()
    }

    fn context(&self) -> Option<&RequestContext> {
        match &self.phase {
            RecoveryPhase::Idle { context } | RecoveryPhase::Failed { context, .. } => {
                context.as_ref()
            }
            RecoveryPhase::Retrying { context, .. } => Some(context),
        }
    }

    fn transition(&mut self, phase: RecoveryPhase) {
        self.phase = phase;
        self.state_tx.send_replace(self.state());
    }

    /**
     * \brief 记录错误并结束重试状态，保留已记住的请求。
     */
    pub fn set_error(&mut self, error: ErrorClassification) {
        let context = self.context().cloned();
        self.transition(RecoveryPhase::Failed { error, context });
    }

    /**
     * \brief 记住最近一次请求，覆盖之前的记录；不改变错误与重试状态。
     */
    pub fn store_request_context(
        &mut self,
        endpoint: impl Into<String>,
        body: Value,
        on_success: SuccessHandler,
    ) {
        let context = RequestContext {
            endpoint: endpoint.into(),
            body,
            on_success,
        };
        match &mut self.phase {
            RecoveryPhase::Idle { context: slot } | RecoveryPhase::Failed { context: slot, .. } => {
                *slot = Some(context);
            }
            RecoveryPhase::Retrying { context: slot, .. } => *slot = context,
        }
    }

    /**
     * \brief 清除错误并丢弃记住的请求。
     */
    pub fn clear_error(&mut self) {
        self.transition(RecoveryPhase::Idle { context: None });
    }

    /**
     * \brief 发起一个新请求：清掉旧的恢复状态，记住本次请求，失败时进入 Failed。
     */
    pub async fn issue(
        &mut self,
        endpoint: impl Into<String>,
        body: Value,
        config: Option<&ProviderConfig>,
        on_success: SuccessHandler,
    ) -> RecoveryOutcome {
        self.clear_error();
        self.store_request_context(endpoint, body.clone(), on_success);
        let Some(context) = self.context().cloned() else {
            return RecoveryOutcome::Skipped;
        };
        let headers = match config.map(provider_headers).transpose() {
            Ok(headers) => headers.unwrap_or_default(),
            Err(e) => return self.fail_with_invalid_config(e),
        };
        match self.transport.post_json(&context.endpoint, headers, &body).await {
            Ok(resp) if resp.is_success() => {
                (context.on_success)(resp.body);
                RecoveryOutcome::Recovered { notice: None }
            }
            Ok(resp) => {
                let status = resp.status;
                let error = parse_ai_error(status, &resp.text().await);
                self.set_error(error.clone());
                RecoveryOutcome::Failed(error)
            }
            Err(error) => {
                self.set_error(error.clone());
                RecoveryOutcome::Failed(error)
            }
        }
    }

    /**
     * \brief 用当前配置原样重放最近一次请求。
     */
    pub async fn handle_retry(&mut self, config: Option<&ProviderConfig>) -> RecoveryOutcome {
        let Some(context) = self.context().cloned() else {
            return RecoveryOutcome::Skipped;
        };
        let headers = match config.map(provider_headers).transpose() {
            Ok(headers) => headers.unwrap_or_default(),
            Err(e) => return self.fail_with_invalid_config(e),
        };
        self.replay(context, headers, RecoveryKind::Retry).await
    }

    /**
     * \brief 临时切换模型（可选 base URL）后重放；不会写回已保存的配置。
     */
    pub async fn handle_switch_model(
        &mut self,
        held: Option<&ProviderConfig>,
        model_id: &str,
        base_url: Option<&str>,
    ) -> RecoveryOutcome {
        let (Some(context), Some(held)) = (self.context().cloned(), held) else {
            return RecoveryOutcome::Skipped;
        };
        let temporary = TemporaryConfig {
            model_id: model_id.to_string(),
            base_url: base_url.map(str::to_string),
        };
        let effective = held.with_override(&temporary);
        let headers = match provider_headers(&effective) {
            Ok(headers) => headers,
            Err(e) => return self.fail_with_invalid_config(e),
        };
        let outcome = self
            .replay(context, headers, RecoveryKind::Switch { model_id })
            .await;
        match outcome {
            RecoveryOutcome::Recovered { .. } => RecoveryOutcome::Recovered {
                notice: Some(format!(
                    "本次请求已临时切换到模型 {}，已保存的配置未改变",
                    model_id
                )),
            },
            other => other,
        }
    }

    async fn replay(
        &mut self,
        context: RequestContext,
        headers: HeaderMap,
        kind: RecoveryKind<'_>,
    ) -> RecoveryOutcome {
        let mut body = context.body.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.insert("_isRetry".to_string(), Value::Bool(true));
            match kind {
                RecoveryKind::Retry => {
                    obj.insert("_recoveryType".to_string(), Value::from("retry"));
                }
                RecoveryKind::Switch { model_id } => {
                    obj.insert("_recoveryType".to_string(), Value::from("switch"));
                    obj.insert("_attemptedModel".to_string(), Value::from(model_id));
                }
            }
        }

        telemetry::log_event(
            "client.recovery",
            &format!("replay endpoint={} kind={:?}", context.endpoint, kind),
        );
        let last_error = match &self.phase {
            RecoveryPhase::Failed { error, .. } => Some(error.clone()),
            RecoveryPhase::Retrying { last_error, .. } => last_error.clone(),
            RecoveryPhase::Idle { .. } => None,
        };
        self.transition(RecoveryPhase::Retrying {
            context: context.clone(),
            last_error,
        });

        match self.transport.post_json(&context.endpoint, headers, &body).await {
            Ok(resp) if resp.is_success() => {
                let on_success = context.on_success.clone();
                self.transition(RecoveryPhase::Idle {
                    context: Some(context),
                });
                on_success(resp.body);
                RecoveryOutcome::Recovered { notice: None }
            }
            Ok(resp) => {
                let status = resp.status;
                let error = parse_ai_error(status, &resp.text().await);
                self.transition(RecoveryPhase::Failed {
                    error: error.clone(),
                    context: Some(context),
                });
                RecoveryOutcome::Failed(error)
            }
            Err(error) => {
                self.transition(RecoveryPhase::Failed {
                    error: error.clone(),
                    context: Some(context),
                });
                RecoveryOutcome::Failed(error)
            }
        }
    }

    fn fail_with_invalid_config(&mut self, err: anyhow::Error) -> RecoveryOutcome {
        let error = ErrorClassification::from_type(
            ErrorType::Unknown,
            format!("模型服务配置无法编码为请求头：{}", err),
        );
        self.set_error(error.clone());
        RecoveryOutcome::Failed(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{classify::classify_network_error, config::resolve_provider_config};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct Call {
        endpoint: String,
        headers: HeaderMap,
        body: Value,
        seen: Option<RecoveryState>,
    }

    enum Scripted {
        Status(u16, &'static str),
        Fail(ErrorClassification),
    }

    #[derive(Clone, Default)]
    struct MockTransport {
        script: Arc<Mutex<Vec<Scripted>>>,
        calls: Arc<Mutex<Vec<Call>>>,
        observer: Arc<Mutex<Option<watch::Receiver<RecoveryState>>>>,
    }

    impl MockTransport {
        fn with(script: Vec<Scripted>) -> Self {
            let mock = Self::default();
            *mock.script.lock().unwrap() = script;
            mock
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RecoveryTransport for MockTransport {
        async fn post_json(
            &self,
            endpoint: &str,
            headers: HeaderMap,
            body: &Value,
        ) -> Result<TransportResponse, ErrorClassification> {
            let seen = self
                .observer
                .lock()
                .unwrap()
                .as_ref()
                .map(|rx| rx.borrow().clone());
            self.calls.lock().unwrap().push(Call {
                endpoint: endpoint.to_string(),
                headers,
                body: body.clone(),
                seen,
            });
            match self.script.lock().unwrap().remove(0) {
                Scripted::Status(status, text) => Ok(TransportResponse {
                    status,
                    body: Box::pin(futures_util::stream::iter(vec![Ok(Bytes::from(text))])),
                }),
                Scripted::Fail(err) => Err(err),
            }
        }
    }

    fn held() -> ProviderConfig {
        ProviderConfig {
            base_url: "https://llm.example.com/v1".to_string(),
            api_key: "sk-held".to_string(),
            model_id: "deepseek-chat".to_string(),
        }
    }

    fn collecting_handler() -> (SuccessHandler, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: SuccessHandler = Arc::new(move |body: ByteStream| {
            let sink = sink.clone();
            tokio::spawn(async move {
                let text = TransportResponse { status: 200, body }.text().await;
                sink.lock().unwrap().push(text);
            });
        });
        (handler, seen)
    }

    fn noop_handler() -> SuccessHandler {
        Arc::new(|_body: ByteStream| {})
    }

    #[tokio::test]
    async fn test_retry_without_context_is_noop() {
        let mock = MockTransport::default();
        let mut ctl = RecoveryController::new(mock.clone());
        assert_eq!(ctl.handle_retry(Some(&held())).await, RecoveryOutcome::Skipped);
        assert_eq!(
            ctl.handle_switch_model(Some(&held()), "gpt-4o", None).await,
            RecoveryOutcome::Skipped
        );
        assert!(mock.calls().is_empty());
        assert_eq!(ctl.state(), RecoveryState::default());
    }

    #[tokio::test]
    async fn test_retry_receiving_429_sets_rate_limit() {
        let mock = MockTransport::with(vec![Scripted::Status(429, r#"{"error":"too many"}"#)]);
        let mut ctl = RecoveryController::new(mock.clone());
        ctl.store_request_context(
            "/api/ai/continue",
            serde_json::json!({"projectId": "p1", "prompt": "go"}),
            noop_handler(),
        );
        assert_eq!(ctl.state(), RecoveryState::default());

        let outcome = ctl.handle_retry(Some(&held())).await;
        assert!(matches!(outcome, RecoveryOutcome::Failed(_)));
        let state = ctl.state();
        assert_eq!(
            state.error.as_ref().map(|e| e.error_type),
            Some(ErrorType::RateLimit)
        );
        assert!(!state.is_retrying);

        let call = &mock.calls()[0];
        assert_eq!(call.endpoint, "/api/ai/continue");
        assert_eq!(call.body["_isRetry"], true);
        assert_eq!(call.body["_recoveryType"], "retry");
        assert_eq!(call.body["prompt"], "go");
        assert_eq!(resolve_provider_config(&call.headers), Some(held()));
    }

    #[tokio::test]
    async fn test_switch_model_uses_temporary_config_only() {
        let mock = MockTransport::with(vec![Scripted::Status(200, "ok")]);
        let mut ctl = RecoveryController::new(mock.clone());
        let (handler, seen) = collecting_handler();
        ctl.store_request_context("/api/ai/expand", serde_json::json!({"prompt": "x"}), handler);
        ctl.set_error(ErrorClassification::from_type(ErrorType::ModelNotFound, "gone"));

        let original = held();
        let snapshot = original.clone();
        let outcome = ctl
            .handle_switch_model(Some(&original), "gpt-4o", Some("https://api.openai.com/v1"))
            .await;

        match outcome {
            RecoveryOutcome::Recovered { notice } => {
                assert!(notice.expect("notice").contains("gpt-4o"))
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(original, snapshot);
        assert_eq!(ctl.state(), RecoveryState::default());

        let call = &mock.calls()[0];
        let sent = resolve_provider_config(&call.headers).expect("headers resolve");
        assert_eq!(sent.model_id, "gpt-4o");
        assert_eq!(sent.base_url, "https://api.openai.com/v1");
        assert_eq!(sent.api_key, "sk-held");
        assert_eq!(call.body["_recoveryType"], "switch");
        assert_eq!(call.body["_attemptedModel"], "gpt-4o");

        tokio::task::yield_now().await;
        for _ in 0..50 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(seen.lock().unwrap().as_slice(), ["ok".to_string()]);
    }

    #[tokio::test]
    async fn test_switch_without_base_url_keeps_held_base() {
        let mock = MockTransport::with(vec![Scripted::Status(500, "<html>bad gateway</html>")]);
        let mut ctl = RecoveryController::new(mock.clone());
        ctl.store_request_context("/api/ai/rewrite", serde_json::json!({}), noop_handler());

        let outcome = ctl.handle_switch_model(Some(&held()), "qwen-max", None).await;
        assert!(matches!(outcome, RecoveryOutcome::Failed(ref e) if e.error_type == ErrorType::Unknown));

        let sent = resolve_provider_config(&mock.calls()[0].headers).expect("headers");
        assert_eq!(sent.base_url, held().base_url);
        assert_eq!(sent.model_id, "qwen-max");
    }

    #[tokio::test]
    async fn test_switch_without_held_config_is_noop() {
        let mock = MockTransport::default();
        let mut ctl = RecoveryController::new(mock.clone());
        ctl.store_request_context("/api/ai/rewrite", serde_json::json!({}), noop_handler());
        assert_eq!(
            ctl.handle_switch_model(None, "gpt-4o", None).await,
            RecoveryOutcome::Skipped
        );
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_network_failure_is_classified() {
        let mock = MockTransport::with(vec![Scripted::Fail(classify_network_error(
            "connect ECONNREFUSED 127.0.0.1:3000",
        ))]);
        let mut ctl = RecoveryController::new(mock);
        ctl.store_request_context("/api/ai/continue", serde_json::json!({}), noop_handler());
        ctl.handle_retry(None).await;
        let state = ctl.state();
        assert_eq!(state.error.map(|e| e.error_type), Some(ErrorType::Network));
        assert!(!state.is_retrying);
        assert!(matches!(ctl.phase(), RecoveryPhase::Failed { context: Some(_), .. }));
    }

    #[tokio::test]
    async fn test_is_retrying_visible_while_in_flight() {
        let mock = MockTransport::with(vec![Scripted::Status(503, r#"{"error":"busy"}"#)]);
        let mut ctl = RecoveryController::new(mock.clone());
        *mock.observer.lock().unwrap() = Some(ctl.subscribe());
        ctl.store_request_context("/api/ai/continue", serde_json::json!({}), noop_handler());

        ctl.handle_retry(Some(&held())).await;
        let seen = mock.calls()[0].seen.clone().expect("observed");
        assert!(seen.is_retrying);
        assert!(seen.error.is_none());
        let state = ctl.state();
        assert!(!state.is_retrying);
        assert!(state.offers_retry());
        assert!(!state.offers_switch());
    }

    #[tokio::test]
    async fn test_error_stays_visible_during_retry() {
        let mock = MockTransport::with(vec![
            Scripted::Status(503, r#"{"error":"busy"}"#),
            Scripted::Status(200, "ok"),
        ]);
        let mut ctl = RecoveryController::new(mock.clone());
        *mock.observer.lock().unwrap() = Some(ctl.subscribe());
        let (handler, _) = collecting_handler();
        ctl.issue("/api/ai/continue", serde_json::json!({}), Some(&held()), handler)
            .await;
        let failed = ctl.state().error.expect("error after failed issue");

        let outcome = ctl.handle_retry(Some(&held())).await;
        assert!(matches!(outcome, RecoveryOutcome::Recovered { .. }));

        let during = mock.calls()[1].seen.clone().expect("observed");
        assert!(during.is_retrying);
        assert_eq!(during.error, Some(failed));
        assert!(during.offers_dismiss());
        assert!(!during.offers_retry());
        assert!(!during.offers_switch());
        assert_eq!(ctl.state(), RecoveryState::default());
    }

    #[tokio::test]
    async fn test_latest_request_wins_and_clear_drops_it() {
        let mock = MockTransport::with(vec![Scripted::Status(200, "ok")]);
        let mut ctl = RecoveryController::new(mock.clone());
        ctl.store_request_context("/api/ai/continue", serde_json::json!({"n": 1}), noop_handler());
        ctl.store_request_context("/api/ai/expand", serde_json::json!({"n": 2}), noop_handler());
        ctl.handle_retry(None).await;
        assert_eq!(mock.calls()[0].endpoint, "/api/ai/expand");
        assert_eq!(mock.calls()[0].body["n"], 2);

        ctl.clear_error();
        assert_eq!(ctl.handle_retry(None).await, RecoveryOutcome::Skipped);
        assert_eq!(mock.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_issue_stores_context_and_records_failure() {
        let mock = MockTransport::with(vec![
            Scripted::Status(401, r#"{"error":"bad key","errorType":"auth","retriable":false,"suggestedActions":["check_config","switch_model"]}"#),
            Scripted::Status(200, "ok"),
        ]);
        let mut ctl = RecoveryController::new(mock.clone());
        let outcome = ctl
            .issue(
                "/api/ai/continue",
                serde_json::json!({"prompt": "p"}),
                Some(&held()),
                noop_handler(),
            )
            .await;
        assert!(matches!(outcome, RecoveryOutcome::Failed(ref e) if e.error_type == ErrorType::Auth));
        let state = ctl.state();
        assert!(state.offers_dismiss());
        assert!(!state.offers_retry());
        assert!(state.offers_switch());
        assert!(mock.calls()[0].body.get("_isRetry").is_none());

        let outcome = ctl.handle_switch_model(Some(&held()), "gpt-4o", None).await;
        assert!(matches!(outcome, RecoveryOutcome::Recovered { .. }));
    }

    #[test]
    fn test_http_transport_urls() {
        let t = HttpTransport::new(reqwest::Client::new(), "http://127.0.0.1:5173/", None);
        assert_eq!(t.url_for("/api/ai/continue"), "http://127.0.0.1:5173/api/ai/continue");
        assert_eq!(t.url_for("https://other/x"), "https://other/x");
    }
}
