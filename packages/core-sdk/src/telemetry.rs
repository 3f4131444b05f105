use std::{fs::OpenOptions, io::Write, path::PathBuf};

use anyhow::Result;
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::models::TelemetryRecord;

/** \brief 写入 ai_history 的提示词最大字符数。 */
pub const PROMPT_PREVIEW_CHARS: usize = 2000;

static TELEMETRY_ENABLED: Lazy<std::sync::RwLock<bool>> =
    Lazy::new(|| std::sync::RwLock::new(false));

/**
 * \brief 更新事件日志开关状态。
 */
pub fn set_enabled(enabled: bool) {
    if let Ok(mut guard) = TELEMETRY_ENABLED.write() {
        *guard = enabled;
    }
}

/**
 * \brief 查询当前事件日志开关状态。
 */
pub fn is_enabled() -> bool {
    TELEMETRY_ENABLED.read().map(|g| *g).unwrap_or(false)
}

/**
 * \brief 记录常规事件。
 */
pub fn log_event(category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    if let Err(err) = write_line("INFO", category, message) {
        eprintln!("telemetry write failed: {}", err);
    }
}

/**
 * \brief 记录错误事件。
 */
pub fn log_error(category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    if let Err(err) = write_line("ERROR", category, message) {
        eprintln!("telemetry write failed: {}", err);
    }
}

fn write_line(level: &str, category: &str, message: &str) -> Result<()> {
    let log_dir = PathBuf::from("logs");
    if !log_dir.exists() {
        std::fs::create_dir_all(&log_dir)?;
    }
    let timestamp = OffsetDateTime::now_utc().format(&Rfc3339)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("inkwell.log"))?;
    writeln!(file, "{} [{}] {} - {}", timestamp, level, category, message)?;
    Ok(())
}

/**
 * \brief 流式生成的归属信息，随请求传入代理。
 */
#[derive(Debug, Clone, Default)]
pub struct TelemetryContext {
    pub user_id: String,
    pub project_id: String,
    pub document_id: Option<String>,
    pub feature: String,
    pub prompt: String,
}

impl TelemetryContext {
    /**
     * \brief 以累积文本生成遥测记录。
     * \param result 实际累积到的输出（可能不完整）
     */
    pub fn into_record(self, model: &str, result: String, latency_ms: i64) -> TelemetryRecord {
        let prompt_chars = self.prompt.chars().count();
        let output_chars = result.chars().count();
        TelemetryRecord {
            user_id: self.user_id,
            project_id: self.project_id,
            document_id: self.document_id,
            feature: self.feature,
            prompt: truncate_chars(&self.prompt, PROMPT_PREVIEW_CHARS),
            model: model.to_string(),
            tokens_used: estimate_tokens(prompt_chars + output_chars),
            latency_ms,
            output_chars: output_chars as i64,
            response_fingerprint: fingerprint(&result),
            result,
        }
    }
}

/**
 * \brief 粗略的 token 估算：约 4 字符 1 token。
 */
pub fn estimate_tokens(chars: usize) -> i64 {
    chars.div_ceil(4) as i64
}

/**
 * \brief 回复内容的 SHA-256 指纹。
 */
pub fn fingerprint(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
