mod settings;

use std::{io::Write, path::PathBuf, sync::Arc};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use inkwell_core_sdk::{
    classify::ErrorClassification,
    config,
    features::Feature,
    llm,
    models::{CharacterSummary, ProviderConfig},
    recovery::{ByteStream, HttpTransport, RecoveryController, RecoveryOutcome, SuccessHandler},
    saliency, server, telemetry,
};

use settings::{ClientConfigStore, DEFAULT_CONFIG_FILE, DEFAULT_SERVER_URL};

/**
 * \brief CLI 程序入口：持有客户端配置，经本地服务发起 AI 写作请求。
 */
#[derive(Parser, Debug)]
#[command(name = "inkwell", version, about = "Inkwell AI writing assistant")]
struct Cli {
    /** \brief 客户端配置文件路径 */
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 保存模型服务配置。
     * \param base_url OpenAI 兼容接口地址
     * \param api_key  API Key（本地模型可留空）
     * \param model    模型 ID
     */
    Init {
        #[arg(long)]
        base_url: String,
        #[arg(long, default_value = "")]
        api_key: String,
        #[arg(long)]
        model: String,
        #[arg(long, default_value = DEFAULT_SERVER_URL)]
        server_url: String,
        #[arg(long, default_value = "local")]
        user_id: String,
        #[arg(long, default_value_t = false)]
        enable_telemetry: bool,
    },

    /**
     * \brief 启动本地 HTTP 服务并提供前端页面。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },

    /**
     * \brief 运行一个写作功能并流式输出；失败时可重试或临时切换模型。
     */
    Write {
        /** \brief 功能名，如 continue / brainstorm / tone-shift */
        #[arg(long, default_value = "continue")]
        feature: String,
        #[arg(long)]
        project: String,
        #[arg(long)]
        document: Option<String>,
        #[arg(long, default_value = "")]
        prompt: String,
        /** \brief 当前正文所在文件 */
        #[arg(long)]
        text_file: Option<PathBuf>,
        #[arg(long)]
        prose_mode: Option<String>,
        /** \brief 失败且可重试时自动重试一次 */
        #[arg(long, default_value_t = false)]
        retry: bool,
        /** \brief 失败时临时切换到该模型重放（不改写已保存配置） */
        #[arg(long)]
        switch_model: Option<String>,
        #[arg(long, requires = "switch_model")]
        switch_base_url: Option<String>,
    },

    /**
     * \brief 列出已配置服务的可用模型。
     */
    Models,

    /**
     * \brief 测试已配置服务的连通性。
     */
    Test,

    /**
     * \brief 对文本文件做显著性分析。
     */
    Saliency {
        #[arg(long)]
        file: PathBuf,
        /** \brief 已知角色名，可重复 */
        #[arg(long = "character")]
        characters: Vec<String>,
        #[arg(long)]
        setting: Option<String>,
        #[arg(long)]
        worldbuilding: Option<String>,
        /** \brief 使用已配置模型增强结果 */
        #[arg(long, default_value_t = false)]
        enhance: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let store = ClientConfigStore::new(&cli.config);

    match cli.command {
        Commands::Init {
            base_url,
            api_key,
            model,
            server_url,
            user_id,
            enable_telemetry,
        } => {
            let provider = ProviderConfig {
                base_url: base_url.trim().to_string(),
                api_key: api_key.trim().to_string(),
                model_id: model.trim().to_string(),
            };
            if !config::is_valid(&provider) {
                bail!("base URL must be absolute, model must not be empty, and values must be printable ASCII");
            }
            let mut settings = store.load()?;
            settings.provider = Some(provider);
            settings.server_url = server_url;
            settings.user_id = user_id;
            settings.telemetry = enable_telemetry;
            store.save(&settings).context("save client config failed")?;
            telemetry::set_enabled(enable_telemetry);
            println!(
                "Saved provider ({} | {}) to {}",
                base_url,
                model,
                store.path().display()
            );
        }
        Commands::Serve { addr } => {
            server::run(&addr).await?;
        }
        Commands::Write {
            feature,
            project,
            document,
            prompt,
            text_file,
            prose_mode,
            retry,
            switch_model,
            switch_base_url,
        } => {
            let feature: Feature = feature.parse()?;
            let (settings, provider) = store.require_provider()?;
            telemetry::set_enabled(settings.telemetry);

            let text = match text_file {
                Some(path) => Some(
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("read {} failed", path.display()))?,
                ),
                None => None,
            };
            let body = serde_json::json!({
                "projectId": project,
                "documentId": document,
                "prompt": prompt,
                "text": text,
                "proseMode": prose_mode,
            });

            let transport = HttpTransport::new(
                reqwest::Client::new(),
                settings.server_url.clone(),
                Some(settings.user_id.clone()),
            );
            let mut controller = RecoveryController::new(transport);
            let (done_tx, mut done_rx) = mpsc::unbounded_channel();

            let mut outcome = controller
                .issue(
                    format!("/api/ai/{}", feature),
                    body,
                    Some(&provider),
                    print_handler(done_tx),
                )
                .await;

            if let RecoveryOutcome::Failed(error) = &outcome {
                report_failure(error);
                let state = controller.state();
                let recovered = if let Some(model) =
                    switch_model.as_deref().filter(|_| state.offers_switch())
                {
                    eprintln!("switching to {} for this request...", model);
                    Some(
                        controller
                            .handle_switch_model(Some(&provider), model, switch_base_url.as_deref())
                            .await,
                    )
                } else if retry && state.offers_retry() {
                    eprintln!("retrying...");
                    Some(controller.handle_retry(Some(&provider)).await)
                } else {
                    None
                };
                if let Some(next) = recovered {
                    if let RecoveryOutcome::Failed(error) = &next {
                        report_failure(error);
                    }
                    outcome = next;
                }
            }

            match outcome {
                RecoveryOutcome::Recovered { notice } => {
                    let printed = done_rx
                        .recv()
                        .await
                        .context("output stream dropped")?
                        .map_err(|e| anyhow!("stream interrupted: {}", e))?;
                    if let Some(notice) = notice {
                        eprintln!("{}", notice);
                    }
                    telemetry::log_event(
                        "cli.write",
                        &format!("feature={} project={} chars={}", feature, project, printed),
                    );
                }
                RecoveryOutcome::Failed(error) => bail!("{}", error.message),
                RecoveryOutcome::Skipped => bail!("nothing to replay"),
            }
        }
        Commands::Models => {
            let (settings, provider) = store.require_provider()?;
            telemetry::set_enabled(settings.telemetry);
            let models = llm::list_models(&reqwest::Client::new(), &provider, &CancellationToken::new())
                .await
                .map_err(|e| anyhow!("{}", e.message))?;
            for model in models {
                println!("{}", model);
            }
        }
        Commands::Test => {
            let (settings, provider) = store.require_provider()?;
            telemetry::set_enabled(settings.telemetry);
            match llm::test_connection(&reqwest::Client::new(), &provider, &CancellationToken::new())
                .await
            {
                Ok(count) => println!("ok: {} models available at {}", count, provider.base_url),
                Err(error) => {
                    report_failure(&error);
                    bail!("connection test failed");
                }
            }
        }
        Commands::Saliency {
            file,
            characters,
            setting,
            worldbuilding,
            enhance,
        } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("read {} failed", file.display()))?;
            let roster: Vec<CharacterSummary> = characters
                .into_iter()
                .map(|name| CharacterSummary {
                    name,
                    ..Default::default()
                })
                .collect();
            let map = if enhance {
                let (settings, provider) = store.require_provider()?;
                telemetry::set_enabled(settings.telemetry);
                saliency::enhance_saliency(
                    &reqwest::Client::new(),
                    &provider,
                    &text,
                    &roster,
                    setting.as_deref(),
                    worldbuilding.as_deref(),
                )
                .await
            } else {
                saliency::compute_saliency(
                    &text,
                    &roster,
                    setting.as_deref(),
                    worldbuilding.as_deref(),
                )
            };
            println!("{}", serde_json::to_string_pretty(&map)?);
        }
    }

    Ok(())
}

fn report_failure(error: &ErrorClassification) {
    let actions: Vec<String> = error
        .suggested_actions
        .iter()
        .filter_map(|a| serde_json::to_value(a).ok())
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    eprintln!(
        "error [{:?}/{:?}] {} (retriable={}, suggested: {})",
        error.error_type,
        error.severity,
        error.message,
        error.retriable,
        actions.join(", ")
    );
}

/**
 * \brief 把成功响应逐块打印到标准输出，结束后回报输出字符数。
 */
fn print_handler(done: mpsc::UnboundedSender<Result<usize, String>>) -> SuccessHandler {
    Arc::new(move |mut body: ByteStream| {
        let done = done.clone();
        tokio::spawn(async move {
            let mut pending = Vec::new();
            let mut printed = 0usize;
            let mut stdout = std::io::stdout();
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        pending.extend_from_slice(&bytes);
                        let text = take_utf8_prefix(&mut pending);
                        printed += text.chars().count();
                        print!("{}", text);
                        stdout.flush().ok();
                    }
                    Err(e) => {
                        println!();
                        let _ = done.send(Err(e));
                        return;
                    }
                }
            }
            if !pending.is_empty() {
                let tail = String::from_utf8_lossy(&pending);
                printed += tail.chars().count();
                print!("{}", tail);
            }
            println!();
            let _ = done.send(Ok(printed));
        });
    })
}

/**
 * \brief 取出缓冲区中完整的 UTF-8 前缀，被分片截断的多字节字符留待下一块。
 */
fn take_utf8_prefix(buf: &mut Vec<u8>) -> String {
    let complete = match std::str::from_utf8(buf.as_slice()) {
        Ok(_) => buf.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        // 非法字节直接有损解码
        Err(_) => buf.len(),
    };
    let rest = buf.split_off(complete);
    let text = String::from_utf8_lossy(buf.as_slice()).into_owned();
    *buf = rest;
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_prefix_holds_split_character() {
        let bytes = "灯灭".as_bytes();
        let mut buf = bytes[..4].to_vec();
        assert_eq!(take_utf8_prefix(&mut buf), "灯");
        assert_eq!(buf.len(), 1);
        buf.extend_from_slice(&bytes[4..]);
        assert_eq!(take_utf8_prefix(&mut buf), "灭");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_write_flags_parse() {
        let cli = Cli::parse_from([
            "inkwell",
            "write",
            "--project",
            "p1",
            "--switch-model",
            "gpt-4o",
            "--switch-base-url",
            "https://api.openai.com/v1",
        ]);
        match cli.command {
            Commands::Write {
                feature,
                switch_model,
                switch_base_url,
                retry,
                ..
            } => {
                assert_eq!(feature, "continue");
                assert_eq!(switch_model.as_deref(), Some("gpt-4o"));
                assert_eq!(switch_base_url.as_deref(), Some("https://api.openai.com/v1"));
                assert!(!retry);
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
    }
}
