//! # pdx-runner
//!
//! Command-line entry point for the Paradex streaming client.
//!
//! Connects to the configured environment, subscribes to the requested
//! channels, and logs every payload until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! pdx-runner --env testnet --channel bbo.BTC-USD-PERP --channel trades.BTC-USD-PERP
//! PDX_JWT=... pdx-runner --config runner.json --channel account --log-level debug
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser;
use pdx_core::config::{AppConfig, Environment, load_config};
use pdx_stream::{StaticToken, StreamClientBuilder, StreamEvent, event_channel};
use serde_json::Value;
use tracing::{error, info, warn};

/// Paradex WebSocket Streaming Runner.
#[derive(Parser)]
#[command(name = "pdx-runner", about = "Paradex WebSocket Streaming Runner")]
struct Cli {
    /// Configuration file path (JSON).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Environment (prod, testnet, nightly). Overrides the config file.
    #[arg(short, long)]
    env: Option<Environment>,

    /// Channel to subscribe to; repeatable. Added to the config file's channels.
    #[arg(long = "channel")]
    channels: Vec<String>,

    /// Bearer token for private channels.
    #[arg(long, env = "PDX_JWT", hide_env_values = true)]
    token: Option<String>,

    /// WebSocket URL override.
    #[arg(long)]
    url: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Optional log directory for file output.
    #[arg(long)]
    log_dir: Option<String>,
}

fn merge(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => AppConfig::default(),
    };
    if let Some(env) = cli.env {
        config.env = env;
    }
    if let Some(url) = &cli.url {
        config.stream.ws_url_override = Some(url.clone());
    }
    if let Some(dir) = &cli.log_dir {
        config.log_dir = Some(dir.clone());
    }
    for channel in &cli.channels {
        if !config.channels.contains(channel) {
            config.channels.push(channel.clone());
        }
    }
    config.stream.validate()?;
    Ok(config)
}

fn log_event(event: &StreamEvent) {
    match event {
        StreamEvent::StateChanged { from, to } => info!("state {from} -> {to}"),
        StreamEvent::Reconnected { attempt } => info!("reconnected after {attempt} attempt(s)"),
        StreamEvent::ReconnectFailed { attempt } => warn!("reconnect attempt {attempt} failed"),
        StreamEvent::AuthRejected { code, message } => warn!("token rejected ({code}): {message}"),
        StreamEvent::MessageDropped { reason } => warn!("dropped message: {reason}"),
        StreamEvent::ValidationFailed { channel, reason } => warn!("{channel}: invalid payload: {reason}"),
        StreamEvent::SubscriptionRejected { channel, code, message } => {
            error!("{channel}: subscription rejected ({code}): {message}")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = merge(&cli)?;

    // 1. Initialize logging
    let module_name = config.module_name.clone().unwrap_or_else(|| "pdx-runner".to_owned());
    pdx_core::logging::init_logging(&cli.log_level, config.log_dir.as_deref(), &module_name);

    if config.channels.is_empty() {
        bail!("no channels to subscribe to (use --channel or the config file's \"channels\")");
    }
    info!("pdx-runner starting: env={}, {} channel(s)", config.env, config.channels.len());

    // 2. Build the client
    let (events_tx, mut events_rx) = event_channel();
    let mut builder = StreamClientBuilder::new(config.env)
        .config(config.stream.clone())
        .events(events_tx)
        .label(module_name.as_str());
    if let Some(token) = &cli.token {
        builder = builder.auth(Arc::new(StaticToken::new(token.as_str())));
    }
    let client = builder.build()?;

    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            log_event(&event);
        }
    });

    // 3. Register channels, then connect (the registry is replayed on connect)
    for channel in &config.channels {
        client
            .subscribe(channel, |channel: &str, envelope: &Value| {
                let data = envelope.pointer("/params/data").unwrap_or(envelope);
                info!("[{channel}] {data}");
            })
            .await;
    }

    if !client.connect().await {
        bail!("failed to connect to {}", client.url());
    }
    info!("streaming from {}, press Ctrl+C to stop", client.url());

    // 4. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    // 5. Close
    client.close().await;
    info!("closed after {} reconnect(s)", client.reconnect_count());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "pdx-runner",
            "--env",
            "prod",
            "--channel",
            "bbo.BTC-USD-PERP",
            "--channel",
            "bbo.BTC-USD-PERP",
            "--url",
            "ws://127.0.0.1:9000",
        ]);
        let config = merge(&cli).unwrap();
        assert_eq!(config.env, Environment::Prod);
        assert_eq!(config.channels, vec!["bbo.BTC-USD-PERP".to_string()]);
        assert_eq!(config.stream.ws_url_override.as_deref(), Some("ws://127.0.0.1:9000"));
    }

    #[test]
    fn bad_url_is_rejected() {
        let cli = Cli::parse_from(["pdx-runner", "--url", "http://example.com"]);
        assert!(merge(&cli).is_err());
    }
}
