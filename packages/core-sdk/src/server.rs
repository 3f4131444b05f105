use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, get_service, post},
    Json, Router,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;

use crate::{
    config::resolve_provider_config,
    db::{SqliteStore, StoryStore},
    error::ProxyError,
    features::Feature,
    llm,
    models::{CharacterSummary, SaliencyMap, StoryContext},
    proxy::{create_stream_response, StreamRequest},
    saliency::{compute_saliency, enhance_saliency, trailing_window, SALIENCY_WINDOW_CHARS},
    story::{build_story_prompt_context, fetch_story_context, PromptContextOptions, ProseMode},
    telemetry::{self, TelemetryContext},
};

/** \brief 调用方身份请求头。 */
pub const HEADER_USER_ID: &str = "x-user-id";

/**
 * \brief 路由共享状态。
 */
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StoryStore>,
    pub client: reqwest::Client,
}

impl AppState {
    pub fn new(store: Arc<dyn StoryStore>) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
        }
    }
}

/**
 * \brief 服务端配置，来自环境变量。
 */
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub db_path: PathBuf,
    pub ui_dir: PathBuf,
    pub ui_fallback: PathBuf,
    pub telemetry: bool,
}

impl ServerOptions {
    pub fn from_env() -> Self {
        let telemetry = std::env::var("INKWELL_TELEMETRY")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "on"))
            .unwrap_or(false);
        Self {
            db_path: std::env::var("INKWELL_DB")
                .unwrap_or_else(|_| "inkwell.db".to_string())
                .into(),
            ui_dir: std::env::var("INKWELL_UI_DIR")
                .unwrap_or_else(|_| "packages/ui/dist".to_string())
                .into(),
            ui_fallback: std::env::var("INKWELL_UI_FALLBACK")
                .unwrap_or_else(|_| "web".to_string())
                .into(),
            telemetry,
        }
    }
}

/**
 * \brief 启动本地 HTTP 服务，配置取自环境变量。
 * \param addr 监听地址，如 "127.0.0.1:5173"
 */
pub async fn run(addr: &str) -> Result<()> {
    serve(addr, ServerOptions::from_env()).await
}

pub async fn serve(addr: &str, options: ServerOptions) -> Result<()> {
    telemetry::set_enabled(options.telemetry);
    let store = SqliteStore::open(&options.db_path)
        .with_context(|| format!("打开数据库失败：{}", options.db_path.display()))?;

    let static_handler = if options.ui_dir.exists() {
        ServeDir::new(&options.ui_dir)
    } else {
        ServeDir::new(&options.ui_fallback)
    }
    .append_index_html_on_directories(true);

    let app = router(AppState::new(Arc::new(store))).fallback_service(get_service(static_handler));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    telemetry::log_event(
        "server",
        &format!("listening addr={} db={}", addr, options.db_path.display()),
    );
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief API 路由（不含静态资源）。
 */
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/ai/test-connection", post(test_connection))
        .route("/api/ai/models", get(list_models))
        .route("/api/ai/saliency", post(saliency))
        .route("/api/ai/{feature}", post(ai_completion))
        .with_state(state)
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct CompletionPayload {
    #[serde(default)]
    project_id: String,
    #[serde(default)]
    document_id: Option<String>,
    /** \brief 用户指令 */
    #[serde(default)]
    prompt: String,
    /** \brief 编辑器中的当前正文，用于场景焦点与续写 */
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    prose_mode: Option<String>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    model_id: Option<String>,
    #[serde(default, rename = "_isRetry")]
    is_retry: bool,
    #[serde(default, rename = "_recoveryType")]
    recovery_type: Option<String>,
    #[serde(default, rename = "_attemptedModel")]
    attempted_model: Option<String>,
}

fn user_id_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(HEADER_USER_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn compose_user_prompt(prompt: &str, text: Option<&str>) -> String {
    let prompt = prompt.trim();
    match text.map(str::trim).filter(|t| !t.is_empty()) {
        Some(text) => {
            let passage = trailing_window(text, SALIENCY_WINDOW_CHARS);
            if prompt.is_empty() {
                format!("[Current passage]\n{}", passage)
            } else {
                format!("[Current passage]\n{}\n\n{}", passage, prompt)
            }
        }
        None => prompt.to_string(),
    }
}

fn scene_focus(ctx: &StoryContext, text: Option<&str>) -> Option<SaliencyMap> {
    let text = text.filter(|t| !t.trim().is_empty())?;
    let bible = ctx.bible.as_ref();
    Some(compute_saliency(
        text,
        &ctx.characters,
        bible.and_then(|b| b.setting.as_deref()),
        bible.and_then(|b| b.worldbuilding.as_deref()),
    ))
}

/**
 * \brief 请求体解析失败（格式错误或缺少 JSON content-type）按 400 JSON 返回。
 */
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ProxyError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ProxyError::BadRequest(rejection.body_text()))
}

/**
 * \brief AI 生成：POST /api/ai/{feature}，返回纯文本流。
 */
async fn ai_completion(
    State(state): State<AppState>,
    Path(feature): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<CompletionPayload>, JsonRejection>,
) -> Result<Response, ProxyError> {
    let config = resolve_provider_config(&headers).ok_or(ProxyError::NotConfigured)?;
    let user_id = user_id_from(&headers).ok_or(ProxyError::Unauthenticated)?;
    let payload = json_body(payload)?;
    let feature: Feature = feature
        .parse()
        .map_err(|e: anyhow::Error| ProxyError::BadRequest(e.to_string()))?;
    let project_id = payload.project_id.trim();
    if project_id.is_empty() {
        return Err(ProxyError::BadRequest("缺少 projectId".to_string()));
    }
    let user_prompt = compose_user_prompt(&payload.prompt, payload.text.as_deref());
    if user_prompt.is_empty() {
        return Err(ProxyError::BadRequest("prompt 与 text 不能同时为空".to_string()));
    }
    let prose_mode = payload
        .prose_mode
        .as_deref()
        .filter(|m| !m.trim().is_empty())
        .map(str::parse::<ProseMode>)
        .transpose()
        .map_err(|e| ProxyError::BadRequest(e.to_string()))?;

    if payload.is_retry {
        telemetry::log_event(
            "server.ai",
            &format!(
                "recovery replay feature={} type={} attempted_model={}",
                feature,
                payload.recovery_type.as_deref().unwrap_or("retry"),
                payload.attempted_model.as_deref().unwrap_or("-")
            ),
        );
    }

    let story = fetch_story_context(state.store.as_ref(), project_id, Some(&user_id));
    let focus = scene_focus(&story, payload.text.as_deref());
    let context = build_story_prompt_context(
        &story,
        &PromptContextOptions {
            feature,
            prose_mode,
            saliency: focus.as_ref(),
        },
    );
    let preset = feature.preset();

    let request = StreamRequest {
        messages: feature.build_messages(&context, &user_prompt),
        max_tokens: payload.max_tokens.unwrap_or(preset.max_tokens),
        temperature: payload.temperature.unwrap_or(preset.temperature),
        model_id: payload.model_id,
        provider_config: Some(config),
    };
    let telemetry_ctx = TelemetryContext {
        user_id,
        project_id: project_id.to_string(),
        document_id: payload.document_id,
        feature: feature.as_str().to_string(),
        prompt: user_prompt,
    };
    create_stream_response(&state.client, request, telemetry_ctx, state.store.clone()).await
}

/**
 * \brief 连接测试：使用请求头中的（可能尚未保存的）配置。
 */
async fn test_connection(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    let config = resolve_provider_config(&headers).ok_or(ProxyError::NotConfigured)?;
    let token = CancellationToken::new();
    match llm::test_connection(&state.client, &config, &token).await {
        Ok(models) => {
            Ok(Json(serde_json::json!({ "ok": true, "models": models })).into_response())
        }
        Err(classification) => {
            telemetry::log_error(
                "server.ai",
                &format!(
                    "test-connection failed base={} type={:?}",
                    config.base_url, classification.error_type
                ),
            );
            Ok((StatusCode::BAD_GATEWAY, Json(classification.to_envelope())).into_response())
        }
    }
}

async fn list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    let config = resolve_provider_config(&headers).ok_or(ProxyError::NotConfigured)?;
    let token = CancellationToken::new();
    match llm::list_models(&state.client, &config, &token).await {
        Ok(models) => Ok(Json(serde_json::json!({ "models": models })).into_response()),
        Err(classification) => {
            Ok((StatusCode::BAD_GATEWAY, Json(classification.to_envelope())).into_response())
        }
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct SaliencyPayload {
    text: String,
    /** \brief 给定时从存储读取角色与设定 */
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    characters: Vec<CharacterSummary>,
    #[serde(default)]
    setting: Option<String>,
    #[serde(default)]
    worldbuilding: Option<String>,
    #[serde(default)]
    enhance: bool,
}

/**
 * \brief 显著性分析：启发式，可选模型增强（逐字段回退）。
 */
async fn saliency(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<SaliencyPayload>, JsonRejection>,
) -> Result<Json<SaliencyMap>, ProxyError> {
    let payload = json_body(payload)?;
    let mut characters = payload.characters;
    let mut setting = payload.setting;
    let mut worldbuilding = payload.worldbuilding;

    if let Some(project_id) = payload.project_id.as_deref().filter(|p| !p.trim().is_empty()) {
        let user_id = user_id_from(&headers).ok_or(ProxyError::Unauthenticated)?;
        let story = fetch_story_context(state.store.as_ref(), project_id, Some(&user_id));
        if characters.is_empty() {
            characters = story.characters;
        }
        if let Some(bible) = story.bible {
            setting = setting.or(bible.setting);
            worldbuilding = worldbuilding.or(bible.worldbuilding);
        }
    }

    let map = if payload.enhance {
        let config = resolve_provider_config(&headers).ok_or(ProxyError::NotConfigured)?;
        enhance_saliency(
            &state.client,
            &config,
            &payload.text,
            &characters,
            setting.as_deref(),
            worldbuilding.as_deref(),
        )
        .await
    } else {
        compute_saliency(
            &payload.text,
            &characters,
            setting.as_deref(),
            worldbuilding.as_deref(),
        )
    };
    Ok(Json(map))
}

/**
 * \brief 存活检查。
 */
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}
