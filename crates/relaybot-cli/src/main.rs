use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use relaybot_config::{AppConfig, ConfigLoader, LogFormat};
use relaybot_gateway::GatewayServer;
use relaybot_security::RedactingWriter;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relaybot", version, about = "Telegram relay for tool-calling language models")]
struct Cli {
    /// Env file to load before reading settings (defaults to ./.env when present)
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Log output format, overriding LOG_FORMAT (text or json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to Telegram and answer messages (the default)
    Run,
    /// Validate the configuration and check the provider credentials
    Check {
        /// Only validate configuration, do not contact the provider
        #[arg(long)]
        offline: bool,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(RedactingWriter::stderr());

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn check(config: AppConfig, offline: bool) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&config)?);

    if config.telegram_token.is_none() {
        warn!("TELEGRAM_TOKEN is not set; `relaybot run` will refuse to start");
    }

    let server = GatewayServer::new(config);
    let relay = server.build_relay()?;
    if offline {
        println!("configuration OK");
        return Ok(());
    }

    let provider = relay.runtime().provider();
    let healthy = relay
        .runtime()
        .health_check()
        .await
        .context("provider health check failed")?;
    if !healthy {
        bail!(
            "{} rejected the health check; verify LLM_API_KEY, LLM_MODEL and LLM_BASE_URL",
            provider.provider_id()
        );
    }
    println!(
        "configuration OK, {} ({}) is reachable",
        provider.provider_id(),
        provider.model()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let loader = ConfigLoader::from_env(cli.env_file.as_deref())?;
    let config = loader.load().context("invalid configuration")?;
    init_tracing(cli.log_format.unwrap_or(config.log_format));
    match loader.env_file() {
        Some(path) => info!("loaded environment from {}", path.display()),
        None => debug!("no .env file found, using process environment"),
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!(
                "starting relaybot {} with {} ({})",
                env!("CARGO_PKG_VERSION"),
                config.llm.provider,
                config.llm.model
            );
            GatewayServer::new(config).run().await
        }
        Commands::Check { offline } => check(config, offline).await,
    }
}
