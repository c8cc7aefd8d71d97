// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Drain demo.
//!
//! Demonstrates:
//! 1. Writing a handful of entries through the Redis write path
//! 2. Draining them into SQL with a paced engine
//! 3. Displaying captured metrics
//! 4. Clean stop on Ctrl-C or once the ledger is empty
//!
//! # Run
//!
//! ```bash
//! DRAIN_REDIS_URL=redis://localhost:6379 \
//! DRAIN_SQL_URL="sqlite://drain_demo.db?mode=rwc" \
//! DRAIN_SYNC_RATE=5 \
//! RUST_LOG=dirty_drain=debug \
//! cargo run --example drain
//! ```

use std::sync::Arc;
use std::time::Duration;

use dirty_drain::{DirtyLedger, RedisLedger, SyncConfig, SyncEngine, WriteThrough};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let mut config = SyncConfig::from_env();
    config.redis_url.get_or_insert_with(|| "redis://localhost:6379".into());
    config.sql_url.get_or_insert_with(|| "sqlite://drain_demo.db?mode=rwc".into());
    config.redis_prefix.get_or_insert_with(|| "demo:".into());

    // ─────────────────────────────────────────────────────────────────────
    // 1. Write some entries (the application side)
    // ─────────────────────────────────────────────────────────────────────
    let writer = RedisLedger::with_prefix(
        config.redis_url.as_deref().unwrap_or_default(),
        config.redis_prefix.as_deref(),
    )
    .await?;

    for i in 0..5 {
        let revision = writer
            .set(&format!("shop:orders:{i}"), format!(r#"{{"order":{i}}}"#).as_bytes())
            .await?;
        println!("   wrote shop:orders:{i} (revision {revision})");
    }
    writer.set("shop:orders:0", br#"{"order":0,"paid":true}"#).await?;
    println!("   pending: {}", writer.pending().await?);

    // ─────────────────────────────────────────────────────────────────────
    // 2. Drain
    // ─────────────────────────────────────────────────────────────────────
    let engine = Arc::new(SyncEngine::connect(config).await?);
    let handle = engine.clone().spawn();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => println!("\n   interrupted"),
        _ = async {
            while writer.pending().await.unwrap_or(0) > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        } => println!("\n   ledger drained"),
    }

    engine.stop();
    handle.await??;

    let stats = engine.stats();
    println!(
        "   persisted={} failed={} quarantined={} stale_acks={}",
        stats.persisted, stats.failed, stats.quarantined, stats.stale_acks
    );

    // ─────────────────────────────────────────────────────────────────────
    // 3. Metrics
    // ─────────────────────────────────────────────────────────────────────
    dump_metrics(&snapshotter);
    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let labels = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
            let value = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
                DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
            };
            format!("{}{} = {}", key.name(), labels, value)
        })
        .collect();
    lines.sort();

    println!("\n   Metrics:");
    for line in lines {
        println!("   └─ {line}");
    }
}
