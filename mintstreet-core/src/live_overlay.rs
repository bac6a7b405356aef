// SSE overlay client: subscribes to a remote MintStreet event stream and
// merges its transaction envelopes into the local history through the push
// path. Reconnects are bounded with linearly growing delays; once the
// budget is spent the overlay settles disconnected and polling remains the
// only feed.

use crate::error::{IndexerError, Result};
use crate::history::HistoryService;
use crate::models::{EnhancedTransaction, StreamEnvelope, StreamEventType};
use crate::webhook::publish_derived;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Overlay link state, observable through a watch channel (the stats view
/// reports it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Linear backoff: attempt n waits n times the base delay.
pub fn reconnect_delay(base_delay_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(base_delay_ms.saturating_mul(u64::from(attempt)))
}

pub struct LiveOverlay {
    cfg: crate::config::OverlayConfig,
    http: reqwest::Client,
    state_tx: watch::Sender<ConnectionState>,
}

impl LiveOverlay {
    pub fn new(cfg: crate::config::OverlayConfig) -> (Self, watch::Receiver<ConnectionState>) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        (
            Self {
                cfg,
                http: reqwest::Client::new(),
                state_tx,
            },
            state_rx,
        )
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    /// Consume the remote stream until shutdown or the reconnect budget is
    /// spent. A successful connection resets the attempt counter.
    pub async fn run(
        &self,
        service: Arc<HistoryService>,
        hub: broadcast::Sender<StreamEnvelope>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let Some(url) = self.cfg.sse_url.clone() else {
            tracing::info!("no overlay stream configured, poll-only mode");
            return;
        };

        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            match self
                .consume_stream(&url, &service, &hub, &mut shutdown, &mut attempt)
                .await
            {
                // Only shutdown ends a stream without an error.
                Ok(()) => break,
                Err(e) => {
                    self.set_state(ConnectionState::Error);
                    attempt += 1;
                    if attempt > self.cfg.max_reconnect_attempts {
                        tracing::warn!(attempt, "overlay reconnect budget spent: {e}");
                        break;
                    }
                    let delay = reconnect_delay(self.cfg.reconnect_base_delay_ms, attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "overlay stream failed: {e}"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn consume_stream(
        &self,
        url: &str,
        service: &HistoryService,
        hub: &broadcast::Sender<StreamEnvelope>,
        shutdown: &mut watch::Receiver<bool>,
        attempt: &mut u32,
    ) -> Result<()> {
        let response = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(IndexerError::Status(response.status().as_u16()));
        }

        self.set_state(ConnectionState::Connected);
        *attempt = 0;
        tracing::info!(url, "overlay stream connected");

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(pos) = buffer.find("\n\n") {
                            let frame: String = buffer.drain(..pos + 2).collect();
                            if let Some(envelope) = parse_frame(&frame) {
                                self.dispatch(envelope, service, hub).await;
                            }
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        return Err(IndexerError::Internal(
                            "overlay stream closed by server".to_string(),
                        ))
                    }
                },
            }
        }
    }

    /// Route one remote event. Transaction envelopes merge into the cache
    /// (fresh inserts re-derive our own fanout); pool-scoped duplicates of
    /// the same transactions are dropped; aggregate events republish as-is.
    async fn dispatch(
        &self,
        envelope: StreamEnvelope,
        service: &HistoryService,
        hub: &broadcast::Sender<StreamEnvelope>,
    ) {
        match envelope.event_type {
            StreamEventType::Transaction => {
                match serde_json::from_value::<EnhancedTransaction>(envelope.data) {
                    Ok(tx) if !tx.instructions.is_empty() => {
                        let fresh = service.apply_live(&[tx]).await;
                        if !fresh.is_empty() {
                            publish_derived(hub, &fresh);
                        }
                    }
                    Ok(_) => {
                        tracing::debug!("transaction event carried no instructions, skipped")
                    }
                    Err(e) => tracing::debug!("transaction event not envelope-shaped: {e}"),
                }
            }
            // The remote emits these alongside the transaction event for the
            // same signature; merging once is enough.
            StreamEventType::PoolTransaction => {}
            StreamEventType::Connection | StreamEventType::Heartbeat => {}
            StreamEventType::NewPools
            | StreamEventType::NewCollections
            | StreamEventType::VolumeUpdate => {
                let _ = hub.send(envelope);
            }
        }
    }
}

/// Extract the JSON payload of one SSE frame. Multiple `data:` lines join
/// with newlines per the SSE framing rules; comment and `event:` lines are
/// skipped.
pub fn parse_frame(frame: &str) -> Option<StreamEnvelope> {
    let mut data = String::new();
    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data.is_empty() {
        return None;
    }
    match serde_json::from_str(&data) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            tracing::debug!("unparseable stream frame: {e}");
            None
        }
    }
}
