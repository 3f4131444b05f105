use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use inkwell_core_sdk::models::ProviderConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "inkwell-client.json";
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:5173";

/**
 * \brief 客户端持有的长期配置。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSettings {
    #[serde(default)]
    pub provider: Option<ProviderConfig>,
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default)]
    pub telemetry: bool,
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_user_id() -> String {
    "local".to_string()
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            provider: None,
            server_url: default_server_url(),
            user_id: default_user_id(),
            telemetry: false,
        }
    }
}

/**
 * \brief 配置文件的唯一读写入口；其余组件只接收显式传入的配置。
 */
#[derive(Debug, Clone)]
pub struct ClientConfigStore {
    path: PathBuf,
}

impl ClientConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /**
     * \brief 读取配置；文件不存在时返回默认值。
     */
    pub fn load(&self) -> Result<ClientSettings> {
        if !self.path.exists() {
            return Ok(ClientSettings::default());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read {} failed", self.path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse {} failed", self.path.display()))
    }

    pub fn save(&self, settings: &ClientSettings) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(settings)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("write {} failed", self.path.display()))
    }

    /**
     * \brief 读取已保存的模型服务配置，未初始化时报错并提示。
     */
    pub fn require_provider(&self) -> Result<(ClientSettings, ProviderConfig)> {
        let settings = self.load()?;
        let provider = settings.provider.clone().context(
            "no provider configured, run: inkwell init --base-url ... --model ... [--api-key ...]",
        )?;
        Ok((settings, provider))
    }
}
