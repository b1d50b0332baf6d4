//! Shardproxy daemon - composition root for the sharding backend
//!
//! Usage:
//!   # Validate configuration and ping every datasource
//!   shardproxyd --config shardproxy.yaml check
//!
//!   # Run a statement on two shards, rows merged by the first column
//!   shardproxyd exec --targets ds_0,ds_1 \
//!     --sql "SELECT id, status FROM t_order WHERE user_id = ?" \
//!     --param 42 \
//!     --order-by 0

mod cli;

use anyhow::{bail, Context};
use clap::Parser;
use cli::{Cli, Command, ExecArgs};
use serde_json::json;
use shardproxy_backend::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the JSON lines
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = BackendConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Command::Exec(ExecArgs {
        timeout_ms: Some(ms),
        ..
    }) = &cli.command
    {
        config.engine.query_timeout_ms = Some(*ms);
    }

    let backend = ShardingBackend::start(config).context("starting sharding backend")?;

    let outcome = match &cli.command {
        Command::Check => run_check(&backend).await,
        Command::Exec(args) => run_exec(&backend, args).await,
    };

    if !backend.shutdown().await {
        tracing::warn!("shutdown timed out with channels still in use");
    }
    outcome
}

async fn run_check(backend: &ShardingBackend) -> anyhow::Result<()> {
    let mut failed = 0usize;
    for name in backend.registry().names() {
        let line = match backend.ping(name).await {
            Ok(latency) => json!({
                "datasource": name,
                "ok": true,
                "latency_ms": latency.as_secs_f64() * 1000.0,
            }),
            Err(e) => {
                failed += 1;
                json!({
                    "datasource": name,
                    "ok": false,
                    "category": format!("{:?}", e.category()),
                    "error": e.to_string(),
                })
            }
        };
        println!("{line}");
    }

    if failed > 0 {
        bail!("{failed} datasource(s) unreachable");
    }
    tracing::info!(datasources = backend.registry().len(), "all datasources reachable");
    Ok(())
}

async fn run_exec(backend: &ShardingBackend, args: &ExecArgs) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let request = args.request()?.with_cancellation(cancel.clone());

    let signal = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            tracing::info!("Cancelling execution...");
            cancel.cancel();
        })
    };

    let result = backend.execute(request).await?;
    let failed_everywhere = result.is_failure();

    let mut rows = result.into_merged_stream();
    let mut printed = 0u64;
    let mut failures = 0usize;
    while let Some(item) = rows.next().await {
        match item {
            Ok(row) => {
                let values: Vec<_> = row.row.values().iter().map(value_to_json).collect();
                println!("{}", json!({ "datasource": &*row.datasource, "row": values }));
                printed += 1;
            }
            Err(e) => {
                failures += 1;
                print_error(&e);
            }
        }
    }
    for (datasource, update) in rows.updates() {
        println!(
            "{}",
            json!({
                "datasource": &**datasource,
                "affected_rows": update.affected_rows,
                "last_insert_id": update.last_insert_id,
                "warnings": update.warnings,
            })
        );
    }
    for error in rows.errors() {
        failures += 1;
        print_error(error);
    }
    signal.abort();

    tracing::info!(rows = printed, failed_shards = failures, "execution finished");
    if failed_everywhere {
        bail!("statement failed on every target");
    }
    Ok(())
}

fn print_error(error: &ShardError) {
    println!(
        "{}",
        json!({
            "datasource": &*error.datasource,
            "category": format!("{:?}", error.error.category()),
            "error": error.error.to_string(),
        })
    );
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Int(v) => json!(v),
        Value::UInt(v) => json!(v),
        Value::Float(v) => json!(v),
        Value::Double(v) => json!(v),
        Value::String(v) => json!(v),
        Value::Bytes(v) => json!(String::from_utf8_lossy(v)),
        other => json!(other.to_string()),
    }
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
