//! Watch ledger closes from one or more servers.
//!
//! Usage: ledger_watch <ws-url> [<ws-url> ...]

use anyhow::{bail, Result};
use ledger_remote::{Remote, RemoteConfig, RemoteEvent, ServerEndpoint};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let urls: Vec<String> = std::env::args().skip(1).collect();
    if urls.is_empty() {
        bail!("usage: ledger_watch <ws-url> [<ws-url> ...]");
    }

    let config = RemoteConfig {
        servers: urls
            .into_iter()
            .map(|url| ServerEndpoint { url, primary: false })
            .collect(),
        ..RemoteConfig::default()
    };
    let remote = Remote::new(config)?;
    let mut events = remote.events();
    remote.connect();

    loop {
        match events.recv().await {
            Ok(RemoteEvent::LedgerClosed(header)) => {
                let close_time = header
                    .close_time_utc()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "?".into());
                println!(
                    "ledger {} closed at {} ({})",
                    header.ledger_index, close_time, header.ledger_hash
                );
            }
            Ok(RemoteEvent::State(state)) => {
                tracing::info!(state = ?state, "remote state");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "event stream interrupted");
            }
        }
    }
}
