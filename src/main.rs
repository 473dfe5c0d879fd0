//! Chainfeed - Option Chain Tick Recorder
//!
//! Ingest daemon: authorize against the broker feed, subscribe to every
//! instrument in the configured option chain, and record decoded ticks into
//! the SQLite tick store. Queries are served from the same store by the
//! `tick_inspector` binary (or any other consumer of the library).

use anyhow::{Context, Result};
use chainfeed_backend::{
    feed::{auth::FeedAuthClient, pipeline::FeedPipeline},
    registry::OptionChain,
    store::{tick_store::TickStore, writer::TickWriter},
};
use dotenv::dotenv;
use std::{env, path::PathBuf, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("🚀 Chainfeed tick recorder starting");

    let access_token = env::var("ACCESS_TOKEN")
        .or_else(|_| env::var("A_TOKEN"))
        .context("ACCESS_TOKEN not set (broker bearer credential)")?;

    let db_path = resolve_data_path(env::var("DB_PATH").ok(), "live_ticks.db");
    let chain_file = env::var("CHAIN_FILE").context("CHAIN_FILE not set (option chain json)")?;

    let writer_buffer = env::var("WRITER_BUFFER")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(4096);

    let chain = OptionChain::load(&chain_file)?;
    let subscription = chain.instrument_ids();
    anyhow::ensure!(
        !subscription.is_empty(),
        "chain file {} holds no instruments",
        chain_file
    );
    info!(
        strikes = chain.len(),
        instruments = subscription.len(),
        "📋 Option chain loaded from {}",
        chain_file
    );

    let store = Arc::new(TickStore::open(&db_path)?);
    let writer = TickWriter::spawn(store.clone(), writer_buffer);

    let auth = match env::var("FEED_AUTHORIZE_URL") {
        Ok(url) => FeedAuthClient::with_url(&access_token, &url)?,
        Err(_) => FeedAuthClient::new(&access_token)?,
    };

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, stopping pipeline");
            let _ = stop_tx.send(true);
        }
    });

    let mut pipeline = FeedPipeline::new(auth, subscription);
    let run_result = pipeline.run(&writer, stop_rx).await;

    // Let in-flight persistence land before reporting.
    writer.shutdown().await;

    let counters = pipeline.counters();
    info!(
        frames = counters.frames,
        ticks = counters.ticks,
        decode_errors = counters.decode_errors,
        status_notices = counters.status_notices,
        "pipeline finished"
    );

    match run_result {
        Ok(exit) => {
            info!(?exit, "feed pipeline closed cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "feed pipeline failed");
            Err(e.into())
        }
    }
}

fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return base.join("data").join(default_filename).to_string_lossy().to_string();
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }

    // Treat relative paths as relative to the crate dir, not the caller's cwd.
    base.join(p).to_string_lossy().to_string()
}

fn load_env() {
    let _ = dotenv();
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chainfeed_backend=debug,chainfeed=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
