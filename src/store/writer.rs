//! Async Persistence Writer
//!
//! Sits between the ingestion loop and the tick store so a slow or contended
//! write never delays the next frame read. Hand-off is a bounded channel with
//! non-blocking `try_send`: if storage falls persistently behind, ticks are
//! dropped with a warning instead of backing up the stream socket.
//! At-most-once, best-effort durability by policy.

use crate::models::Tick;
use crate::store::tick_store::TickStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

enum WriterMessage {
    Tick(Tick),
    Flush(tokio::sync::oneshot::Sender<()>),
    Shutdown,
}

/// Counters for dropped/persisted ticks.
#[derive(Debug, Default)]
pub struct WriterStats {
    pub persisted: AtomicU64,
    pub dropped_backpressure: AtomicU64,
    pub dropped_storage: AtomicU64,
}

/// Handle to the background persistence task.
pub struct TickWriter {
    tx: mpsc::Sender<WriterMessage>,
    stats: Arc<WriterStats>,
    task: tokio::task::JoinHandle<()>,
}

impl TickWriter {
    /// Spawn the writer task. `capacity` caps in-flight persistence work.
    pub fn spawn(store: Arc<TickStore>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let stats = Arc::new(WriterStats::default());

        let task_stats = stats.clone();
        let task = tokio::spawn(async move {
            run_writer(store, rx, task_stats, capacity).await;
        });

        Self { tx, stats, task }
    }

    /// Hand off one observation without blocking. A full channel drops the
    /// tick: losing one tick beats stalling ingestion.
    pub fn record(&self, tick: Tick) {
        if let Err(e) = self.tx.try_send(WriterMessage::Tick(tick)) {
            self.stats.dropped_backpressure.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "persistence channel full, dropping tick");
        }
    }

    /// Flush buffered writes and wait for them to land.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        if self.tx.send(WriterMessage::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Drain, flush and stop the writer task.
    pub async fn shutdown(self) {
        let _ = self.tx.send(WriterMessage::Shutdown).await;
        let _ = self.task.await;
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }
}

async fn run_writer(
    store: Arc<TickStore>,
    mut rx: mpsc::Receiver<WriterMessage>,
    stats: Arc<WriterStats>,
    capacity: usize,
) {
    let mut buffer: Vec<Tick> = Vec::with_capacity(capacity.min(256));
    let mut flush_timer = tokio::time::interval(FLUSH_INTERVAL);
    flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(WriterMessage::Tick(tick)) => {
                        buffer.push(tick);
                        if buffer.len() >= buffer.capacity() {
                            write_out(&store, &mut buffer, &stats);
                        }
                    }
                    Some(WriterMessage::Flush(done)) => {
                        write_out(&store, &mut buffer, &stats);
                        let _ = done.send(());
                    }
                    Some(WriterMessage::Shutdown) | None => {
                        write_out(&store, &mut buffer, &stats);
                        info!("tick writer shutting down");
                        return;
                    }
                }
            }
            _ = flush_timer.tick() => {
                write_out(&store, &mut buffer, &stats);
            }
        }
    }
}

fn write_out(store: &TickStore, buffer: &mut Vec<Tick>, stats: &WriterStats) {
    if buffer.is_empty() {
        return;
    }
    match store.append_batch(buffer) {
        Ok(n) => {
            stats.persisted.fetch_add(n as u64, Ordering::Relaxed);
            debug!(rows = n, "persisted tick batch");
        }
        Err(e) => {
            // Transient contention or a rejected write: log and drop the
            // batch rather than retrying into a growing backlog.
            stats
                .dropped_storage
                .fetch_add(buffer.len() as u64, Ordering::Relaxed);
            warn!(error = %e, dropped = buffer.len(), "tick batch write failed, dropping");
        }
    }
    buffer.clear();
}
