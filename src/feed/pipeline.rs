//! Tick Feed Ingestion Pipeline
//!
//! Owns the streaming connection lifecycle:
//! Unauthenticated -> Connecting -> Subscribed -> Streaming -> Closed, with
//! Failed reachable from any state. One socket, strictly sequential reads;
//! persistence is handed off to the async writer and never awaited before
//! the next frame. Reconnect policy is deliberately external: `run` returns
//! on close or failure and the operator decides what happens next.

use crate::feed::auth::{AuthError, FeedAuthClient};
use crate::feed::wire::{self, DecodedFrame};
use crate::models::Tick;
use crate::store::writer::TickWriter;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Subscription control envelope, the first client-to-server message.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeMessage {
    pub guid: String,
    pub method: String,
    pub data: SubscribeData,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscribeData {
    pub mode: String,
    #[serde(rename = "instrumentKeys")]
    pub instrument_keys: Vec<String>,
}

impl SubscribeMessage {
    /// Full-mode subscription with a fresh correlation id. The guid must be
    /// unique per connection attempt; the remote end may reject a repeat.
    pub fn full(instrument_keys: Vec<String>) -> Self {
        Self {
            guid: Uuid::new_v4().to_string(),
            method: "sub".to_string(),
            data: SubscribeData {
                mode: "full".to_string(),
                instrument_keys,
            },
        }
    }
}

/// Fatal pipeline failures. Decode errors are not here: one bad frame is
/// logged and skipped, never fatal.
#[derive(Debug)]
pub enum PipelineError {
    Auth(AuthError),
    Connect(tokio_tungstenite::tungstenite::Error),
    Socket(tokio_tungstenite::tungstenite::Error),
    Subscribe(tokio_tungstenite::tungstenite::Error),
    Encode(serde_json::Error),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auth(e) => write!(f, "authorization failed: {}", e),
            Self::Connect(e) => write!(f, "failed to connect to feed: {}", e),
            Self::Socket(e) => write!(f, "feed socket error: {}", e),
            Self::Subscribe(e) => write!(f, "failed to send subscription: {}", e),
            Self::Encode(e) => write!(f, "failed to encode subscription: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Auth(e) => Some(e),
            Self::Connect(e) | Self::Socket(e) | Self::Subscribe(e) => Some(e),
            Self::Encode(e) => Some(e),
        }
    }
}

/// Why the receive loop ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineExit {
    /// Remote end closed the connection cleanly.
    RemoteClosed,
    /// Local stop requested.
    Stopped,
}

/// Per-run ingestion counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct PipelineCounters {
    pub frames: u64,
    pub ticks: u64,
    pub decode_errors: u64,
    pub status_notices: u64,
}

/// The streaming ingestion pipeline. The subscription set is fixed for the
/// lifetime of one run; no dynamic re-subscription.
pub struct FeedPipeline {
    auth: FeedAuthClient,
    subscription: Vec<String>,
    counters: PipelineCounters,
}

impl FeedPipeline {
    pub fn new(auth: FeedAuthClient, subscription: Vec<String>) -> Self {
        Self {
            auth,
            subscription,
            counters: PipelineCounters::default(),
        }
    }

    pub fn counters(&self) -> PipelineCounters {
        self.counters
    }

    /// Authorize, connect, subscribe, then pump frames into `writer` until
    /// the remote closes, `stop` fires, or the socket fails.
    pub async fn run(
        &mut self,
        writer: &TickWriter,
        mut stop: tokio::sync::watch::Receiver<bool>,
    ) -> Result<PipelineExit, PipelineError> {
        // Unauthenticated -> Connecting: exchange the credential for the
        // stream endpoint. No retry; a bad credential is refreshed externally.
        let ws_url = self.auth.authorize().await.map_err(PipelineError::Auth)?;
        info!("🔌 Connecting to tick feed...");

        let (ws_stream, response) = connect_async(&ws_url)
            .await
            .map_err(PipelineError::Connect)?;
        info!("✅ Feed connected (status: {})", response.status());

        let (mut write, mut read) = ws_stream.split();

        // Connecting -> Subscribed: one control message naming every
        // instrument, fresh guid for this attempt.
        let sub = SubscribeMessage::full(self.subscription.clone());
        let sub_json = serde_json::to_vec(&sub).map_err(PipelineError::Encode)?;
        write
            .send(Message::Binary(sub_json))
            .await
            .map_err(PipelineError::Subscribe)?;
        info!(
            instruments = self.subscription.len(),
            guid = %sub.guid,
            "📡 Subscribed to tick feed"
        );

        // Subscribed -> Streaming: sequential receive loop. Persistence is
        // dispatched through the writer and never awaited here.
        loop {
            let message = tokio::select! {
                m = read.next() => m,
                _ = stop_requested(&mut stop) => {
                    info!("stop requested, closing feed");
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(PipelineExit::Stopped);
                }
            };

            let Some(message) = message else {
                info!("feed stream ended");
                return Ok(PipelineExit::RemoteClosed);
            };

            match message {
                Ok(Message::Binary(data)) => {
                    self.counters.frames += 1;
                    self.handle_frame(&data, writer);
                }
                Ok(Message::Text(text)) => {
                    // The feed speaks binary; a text frame is control noise.
                    debug!("unexpected text message: {}", clip_utf8(&text, 200));
                }
                Ok(Message::Ping(ping)) => {
                    write
                        .send(Message::Pong(ping))
                        .await
                        .map_err(PipelineError::Socket)?;
                }
                Ok(Message::Pong(_)) => {}
                Ok(Message::Close(frame)) => {
                    info!("feed closed by server: {:?}", frame);
                    return Ok(PipelineExit::RemoteClosed);
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "feed read error");
                    return Err(PipelineError::Socket(e));
                }
            }
        }
    }

    /// Decode one frame and hand its ticks to the writer. Decode failures
    /// are contained: log, count, continue.
    fn handle_frame(&mut self, data: &[u8], writer: &TickWriter) {
        match wire::decode_frame(data) {
            Ok(DecodedFrame::Ticks(feeds)) => {
                // One ingestion stamp per frame: within an instrument, order
                // follows frame arrival order.
                let ts = Utc::now().timestamp_micros();
                for (instrument_id, fields) in feeds {
                    self.counters.ticks += 1;
                    writer.record(Tick {
                        instrument_id,
                        ts,
                        last_price: fields.last_price,
                        prev_close: fields.prev_close,
                        open_interest: fields.open_interest,
                        implied_vol: fields.implied_vol,
                        delta: fields.delta,
                        gamma: fields.gamma,
                        vega: fields.vega,
                        theta: fields.theta,
                    });
                }
            }
            Ok(DecodedFrame::MarketStatus(status)) => {
                // Logged, not persisted.
                self.counters.status_notices += 1;
                info!(status = %status, "market status notice");
            }
            Err(e) => {
                self.counters.decode_errors += 1;
                warn!(error = %e, bytes = data.len(), "dropping undecodable frame");
            }
        }
    }
}

/// Resolves once a stop is requested. A dropped sender means no stop will
/// ever arrive; the future then stays pending instead of waking the select
/// loop on every pass.
async fn stop_requested(stop: &mut tokio::sync::watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Clip a log excerpt to at most `max_bytes`, backing up to the nearest
/// char boundary so multibyte text never panics the slice.
fn clip_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::wire::{encode_market_status, encode_ticks, Sections, TickFields};
    use crate::store::tick_store::TickStore;
    use std::sync::Arc;

    #[test]
    fn test_clip_utf8_backs_up_to_char_boundary() {
        // 100 euro signs = 300 bytes; byte 200 lands mid-character.
        let text = "€".repeat(100);
        let clipped = clip_utf8(&text, 200);
        assert_eq!(clipped.len(), 198);
        assert!(text.starts_with(clipped));
    }

    #[test]
    fn test_clip_utf8_leaves_short_text_alone() {
        assert_eq!(clip_utf8("pong", 200), "pong");
        assert_eq!(clip_utf8("", 200), "");
    }

    #[tokio::test]
    async fn test_stop_requested_fires_on_signal() {
        let (tx, mut rx) = tokio::sync::watch::channel(false);
        tx.send(true).unwrap();
        stop_requested(&mut rx).await;
    }

    #[tokio::test]
    async fn test_dropped_stop_sender_stays_pending() {
        let (tx, mut rx) = tokio::sync::watch::channel(false);
        drop(tx);
        // No stop will ever arrive; the future must not resolve (or spin).
        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(50), stop_requested(&mut rx))
                .await;
        assert!(waited.is_err());
    }

    #[test]
    fn test_subscribe_message_shape() {
        let msg = SubscribeMessage::full(vec!["NSE_FO|1".to_string(), "NSE_FO|2".to_string()]);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"method\":\"sub\""));
        assert!(json.contains("\"mode\":\"full\""));
        assert!(json.contains("\"instrumentKeys\""));
        assert!(json.contains("NSE_FO|1"));
    }

    #[test]
    fn test_subscribe_guid_fresh_per_attempt() {
        let a = SubscribeMessage::full(vec!["X".to_string()]);
        let b = SubscribeMessage::full(vec!["X".to_string()]);
        assert_ne!(a.guid, b.guid);
    }

    fn test_pipeline() -> FeedPipeline {
        let auth = FeedAuthClient::with_url("token", "http://localhost/authorize").unwrap();
        FeedPipeline::new(auth, vec!["X".to_string()])
    }

    #[tokio::test]
    async fn test_handle_frame_persists_ticks() {
        let store = Arc::new(TickStore::open_memory().unwrap());
        let writer = TickWriter::spawn(store.clone(), 64);
        let mut pipeline = test_pipeline();

        let fields = TickFields {
            last_price: 100.0,
            prev_close: 95.0,
            ..Default::default()
        };
        let frame = encode_ticks([("X", &fields, Sections::LTPC)]);
        pipeline.handle_frame(&frame, &writer);
        writer.flush().await;

        assert_eq!(store.len(), 1);
        assert_eq!(pipeline.counters().ticks, 1);
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_handle_frame_skips_bad_frame_and_continues() {
        let store = Arc::new(TickStore::open_memory().unwrap());
        let writer = TickWriter::spawn(store.clone(), 64);
        let mut pipeline = test_pipeline();

        pipeline.handle_frame(&[0xAA, 0xBB], &writer);
        let fields = TickFields {
            last_price: 50.0,
            ..Default::default()
        };
        let frame = encode_ticks([("Y", &fields, Sections::LTPC)]);
        pipeline.handle_frame(&frame, &writer);
        writer.flush().await;

        assert_eq!(pipeline.counters().decode_errors, 1);
        assert_eq!(store.len(), 1);
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_handle_frame_logs_status_without_persisting() {
        let store = Arc::new(TickStore::open_memory().unwrap());
        let writer = TickWriter::spawn(store.clone(), 64);
        let mut pipeline = test_pipeline();

        pipeline.handle_frame(&encode_market_status("NORMAL_CLOSE"), &writer);
        writer.flush().await;

        assert_eq!(pipeline.counters().status_notices, 1);
        assert_eq!(store.len(), 0);
        writer.shutdown().await;
    }
}
