use std::sync::Arc;

use anyhow::Context;
use relaybot_channels::{Channel, TelegramChannel};
use relaybot_config::AppConfig;
use relaybot_security::Allowlist;
use tracing::info;

use crate::bootstrap::{build_provider, build_runtime};
use crate::relay::Relay;

/// Runs the Telegram relay until the process is asked to stop.
pub struct GatewayServer {
    config: AppConfig,
}

impl GatewayServer {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    /// Build the relay from configuration without connecting anywhere.
    pub fn build_relay(&self) -> anyhow::Result<Arc<Relay>> {
        let provider = build_provider(&self.config.llm).context("failed to build LLM provider")?;
        let runtime = build_runtime(&self.config, provider).context("failed to build agent runtime")?;
        let allowlist = Allowlist::new(
            self.config.access.allowed_users.iter().copied(),
            self.config.access.allowed_groups.iter().copied(),
        );
        if allowlist.is_public() {
            info!("no allowlist configured, answering every chat");
        }
        Ok(Arc::new(Relay::new(Arc::new(runtime), allowlist)))
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let token = self.config.require_telegram_token()?.to_string();
        let relay = self.build_relay()?;

        let mut channel = TelegramChannel::new(token, relay.on_message_fn());
        channel
            .connect()
            .await
            .context("failed to connect to Telegram")?;
        if let Some(identity) = channel.identity() {
            relay.set_bot_username(identity.username.clone());
        }

        info!("relaybot is running, press Ctrl+C to stop");
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;

        info!("shutting down");
        channel.disconnect().await?;
        Ok(())
    }
}
