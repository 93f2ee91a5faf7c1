//! sl-watch - Stream watcher
//!
//! Opens the configured windowed subscriptions and prints every committed
//! change and connectivity alert as one JSON line on stdout. Logs go to
//! stderr.
//!
//! The server side is a simulated table on an in-memory transport: it is
//! seeded at startup, changed periodically, and the connection is dropped and
//! restored every few changes so resume-on-reconnect can be observed.
//!
//! Usage:
//!   sl-watch [OPTIONS]
//!
//! If no config file is provided, watches the first 20 records of a seeded
//! `nodes` table.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use sl_stream::testing::{numbered_records, SimulatedTable};
use sl_stream::{
    Alert, ConnectionSupervisor, MockTransport, RecordKey, StreamSession, StreamUpdate,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{DemoConfig, WatchConfig};

#[derive(Parser)]
#[command(name = "sl-watch")]
#[command(author, version, about = "Watch windowed table streams")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "SL_WATCH_CONFIG")]
    config: Option<PathBuf>,

    /// How long to wait for a subscription ack (overrides config)
    #[arg(long)]
    ack_timeout_ms: Option<u64>,

    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// One line of stdout
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum OutputLine<'a> {
    Change(&'a StreamUpdate),
    Alert(&'a Alert),
}

fn print_line(line: &OutputLine<'_>) {
    match serde_json::to_string(line) {
        Ok(json) => println!("{}", json),
        Err(e) => warn!(error = %e, "Failed to encode output line"),
    }
}

fn init_logging(cli: &Cli) {
    let filter = if cli.verbose {
        EnvFilter::new("sl_watch=debug,sl_stream=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("sl_watch=info,sl_stream=info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            cli.json_logs
                .then(|| fmt::layer().json().with_writer(std::io::stderr)),
        )
        .with(
            (!cli.json_logs).then(|| fmt::layer().with_target(false).with_writer(std::io::stderr)),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = WatchConfig::load(cli.config.as_deref())?
        .merge_with_args(cli.ack_timeout_ms)
        .context("Invalid command-line override")?;
    info!(
        streams = config.streams.len(),
        ack_timeout_ms = config.client.ack_timeout_ms,
        "Starting sl-watch"
    );

    let transport = Arc::new(MockTransport::default());
    let table = SimulatedTable::attach(&config.demo.table, &config.demo.key_field, transport.clone());
    table.seed(numbered_records(&config.demo.key_field, 1..=config.demo.seed_records));
    info!(table = %table.name(), records = table.len(), "Simulated table seeded");

    let supervisor = ConnectionSupervisor::new(transport.clone(), config.client.clone());
    let mut alerts = supervisor.subscribe_alerts();
    let dispatch = supervisor.spawn();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut sessions = Vec::new();
    for query in config.streams.iter().cloned() {
        let session = supervisor
            .open_session(query, tx.clone())
            .await
            .context("Failed to open stream")?;
        info!(stream_tag = %session.stream_tag(), status = ?session.status(), "Stream opened");
        sessions.push(session);
    }
    drop(tx);

    let churn = tokio::spawn(churn(table.clone(), transport.clone(), config.demo.clone()));

    let deadline = async {
        match cli.duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            update = rx.recv() => match update {
                Some(update) => print_line(&OutputLine::Change(&update)),
                None => break,
            },
            alert = alerts.recv() => match alert {
                Ok(alert) => print_line(&OutputLine::Alert(&alert)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Alert output lagged")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            _ = &mut deadline => {
                info!("Run time elapsed, shutting down");
                break;
            }
        }
    }

    churn.abort();
    for session in &sessions {
        summarize(session);
    }
    supervisor.shutdown().await;
    dispatch.abort();

    Ok(())
}

fn summarize(session: &StreamSession) {
    let query = session.query();
    info!(
        stream_tag = %session.stream_tag(),
        records = session.len(),
        start_key = ?query.window.start_key,
        end_key = ?query.window.end_key,
        status = ?session.status(),
        "Final window"
    );
}

/// Keep changing the table, and periodically drop the connection
async fn churn(table: Arc<SimulatedTable>, transport: Arc<MockTransport>, demo: DemoConfig) {
    let mut interval = tokio::time::interval(Duration::from_millis(demo.churn_interval_ms));
    let span = demo.seed_records.max(1);
    let mut tick: i64 = 0;

    loop {
        interval.tick().await;
        tick += 1;

        // walk the key space, touching both edges of the table now and then
        let key = (tick * 7919) % (span + 10) - 5;
        if tick % 4 == 0 {
            if table.delete(&RecordKey::Int(key)) {
                debug!(key, "Deleted record");
            }
        } else {
            let record = serde_json::json!({
                demo.key_field.as_str(): key,
                "name": format!("item-{}", key),
                "rev": tick,
            });
            if let Err(e) = table.upsert(record) {
                warn!(error = %e, "Upsert rejected");
            }
        }

        if demo.bounce_every > 0 && tick as u64 % demo.bounce_every == 0 {
            info!("Dropping connection");
            transport.set_connected(false);
            tokio::time::sleep(Duration::from_millis(demo.churn_interval_ms)).await;
            transport.set_connected(true);
        }
    }
}
