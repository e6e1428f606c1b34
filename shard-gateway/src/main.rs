//! Shard Gateway - Main entry point
//!
//! Reads newline-delimited JSON messages from stdin, e.g.
//!
//! ```text
//! {"topic":"sheet.read","headers":{"x-tenant-id":"tenant-alpha"},"payload":{"sql":"SELECT 1"}}
//! ```
//!
//! and writes one JSON outcome per message to stdout. Shards come from
//! `SHARD_<n>_URL`; `postgres://` URLs connect to PostgreSQL and
//! `memory://` URLs run on the in-memory backend for dry runs.

use shard_gateway::{Gateway, GatewayConfig, GatewayPoolFactory};
use shard_pool::PoolFactory;
use std::sync::Arc;
use tenant_context::InboundMessage;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; stdout is reserved for outcomes
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // Load configuration from environment
    let config = GatewayConfig::from_env();
    if config.shards.is_empty() {
        warn!("No SHARD_<n>_URL variables set, every tenant message will fail routing");
    }

    // Create message and outcome channels
    let (message_tx, message_rx) = mpsc::unbounded_channel();
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();

    let factory: Arc<dyn PoolFactory> = Arc::new(GatewayPoolFactory::new());
    let gateway = Gateway::new(config, factory, message_rx)
        .await
        .with_outcomes(outcome_tx);
    let manager = Arc::clone(gateway.manager());

    let gateway_handle = tokio::spawn(gateway.run());
    let printer_handle = tokio::spawn(async move {
        while let Some(outcome) = outcome_rx.recv().await {
            match serde_json::to_string(&outcome) {
                Ok(line) => println!("{}", line),
                Err(err) => warn!(error = %err, "Failed to encode outcome"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_number = 0u64;
    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<InboundMessage>(line) {
            Ok(message) => {
                if message_tx.send(message).is_err() {
                    break;
                }
            }
            Err(err) => warn!(line = line_number, error = %err, "Skipping malformed message"),
        }
    }
    drop(message_tx);

    let summary = gateway_handle.await?;
    printer_handle.await?;

    info!(
        received = summary.received,
        succeeded = summary.succeeded,
        failed = summary.failed,
        metrics = %serde_json::to_string(&manager.get_metrics_snapshot())?,
        "Input finished"
    );
    manager.close().await;

    Ok(())
}
