mod bootstrap;

use std::path::PathBuf;

use anyhow::{Context, Result};
use celia_common::mask_secret;
use celia_config::{AppConfig, ConfigLoader};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Parser)]
#[command(
    name = "celia",
    version,
    about = "Celia - Q&A assistant with markdown RAG on Telegram"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error); overrides `log_level` in the config
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Config file (celia.yml or celia.toml); defaults to the working or config directory
    #[arg(long, global = true, env = "CELIA_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the knowledge base and serve the Telegram webhook
    Start {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
    },

    /// Embed the markdown file into the vector store
    Index,

    /// Answer one question from the command line
    Ask {
        question: String,
    },

    /// Validate configuration and environment
    Check,

    /// Show the status of a running gateway
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; variables may come from the environment.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Loaded before the subscriber exists so its `log_level` can take part.
    let mut config = match &cli.config {
        Some(path) => ConfigLoader::load_file(path)?,
        None => ConfigLoader::new().load()?,
    };
    config.apply_env(|key| std::env::var(key).ok());

    let level = log_level(cli.log_level.as_deref(), config.log_level.as_deref());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            config.validate()?;

            let gateway = bootstrap::build_gateway(&config).await?;
            gateway.run().await?;
        }
        Commands::Index => {
            let rag = bootstrap::build_rag(&config).await?;
            let entries = rag
                .load()
                .await
                .with_context(|| format!("failed to index {}", config.rag.file_path.display()))?;
            let stored = rag.store().count().await?;
            println!(
                "Indexed {entries} entries from {} ({stored} documents in '{}')",
                config.rag.file_path.display(),
                config.store.collection_name
            );
        }
        Commands::Ask { question } => {
            let (assistant, _) = bootstrap::build_rag_assistant(&config).await?;
            let reply = assistant.process_message("cli", &question, &[]).await?;
            println!("{reply}");
        }
        Commands::Check => {
            config.validate()?;
            print_summary(&config);
            println!("Configuration OK");
        }
        Commands::Status => {
            let url = format!(
                "http://{}:{}/api/status",
                config.gateway.host, config.gateway.port
            );
            info!("querying {url}");

            let resp = reqwest::get(&url).await.map_err(|_| {
                anyhow::anyhow!(
                    "Gateway is not running at {}:{}",
                    config.gateway.host,
                    config.gateway.port
                )
            })?;

            let body = resp.json::<serde_json::Value>().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }

    Ok(())
}

fn print_summary(config: &AppConfig) {
    let secret = |value: &Option<String>| {
        value
            .as_deref()
            .map(mask_secret)
            .unwrap_or_else(|| "(unset)".to_string())
    };

    println!(
        "gateway:    {}:{} (webhook {})",
        config.gateway.host,
        config.gateway.port,
        config.gateway.webhook_url.as_deref().unwrap_or("(unset)")
    );
    println!(
        "telegram:   token {}, stream mode {:?}",
        secret(&config.telegram.token),
        config.telegram.stream_mode
    );
    println!("openai:     key {}", secret(&config.llm.api_key));
    println!(
        "store:      {:?} {}.{} (index '{}', {} dims)",
        config.store.backend,
        config.store.db_name,
        config.store.collection_name,
        config.store.index_name,
        config.store.num_dimensions
    );
    println!(
        "cache:      {:?}, expires after {}s",
        config.cache.backend, config.cache.expire_secs
    );
    println!(
        "knowledge:  {} ({})",
        config.rag.file_path.display(),
        config.rag.name
    );
}

/// `RUST_LOG` aside, the flag wins over the config file, then `info`.
fn log_level<'a>(flag: Option<&'a str>, config: Option<&'a str>) -> &'a str {
    flag.or(config)
        .map(str::trim)
        .filter(|level| !level.is_empty())
        .unwrap_or(DEFAULT_LOG_LEVEL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_prefers_flag_then_config() {
        assert_eq!(log_level(Some("debug"), Some("warn")), "debug");
        assert_eq!(log_level(None, Some("warn")), "warn");
        assert_eq!(log_level(None, None), "info");
        assert_eq!(log_level(None, Some("  ")), "info");
    }

    #[test]
    fn config_file_log_level_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("celia.yml");
        std::fs::write(&path, "log_level: trace\n").unwrap();

        let config = ConfigLoader::load_file(&path).unwrap();
        assert_eq!(log_level(None, config.log_level.as_deref()), "trace");
    }
}
