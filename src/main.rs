//! Tictac Channel Client
//!
//! Opens an authenticated session, checks for an open payment channel and
//! stays connected until Ctrl-C.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tictac_channel::{
    check_channels, ChannelCheck, ClientConfig, LocalSigner, SessionClient, Signer, VERSION,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Tictac Channel Client v{}", VERSION);

    let config = ClientConfig::from_env();
    let signer: Arc<dyn Signer> = match std::env::var("SIGNER_SECRET_KEY") {
        Ok(secret) => Arc::new(LocalSigner::from_secret_hex(&secret).context("SIGNER_SECRET_KEY is not a valid key")?),
        Err(_) => {
            warn!("SIGNER_SECRET_KEY not set, using a throwaway key");
            Arc::new(LocalSigner::generate())
        }
    };

    info!("Identity: {}", signer.identity());
    info!("Service: {}", config.url);

    let client = SessionClient::new(config, signer);
    let _status = client.on_status_change(|event| info!("Status -> {} at {}", event.status, event.at));
    let _messages = client.on_message(|message| info!("Notification: {}", message));

    client.connect().await.context("failed to open session")?;

    let identity = client.identity().to_string();
    match check_channels(&client, &identity).await.context("channel lookup failed")? {
        ChannelCheck::Open(channels) => {
            for channel in &channels {
                info!("Open channel {} ({})", channel.channel_id, channel.token.as_deref().unwrap_or("-"));
            }
        }
        ChannelCheck::CreationRequired => {
            info!("No open channel for {}; one must be created before playing", identity);
        }
    }

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    info!("Shutting down");
    client.close().await;

    Ok(())
}
