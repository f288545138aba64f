use futures::StreamExt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::sse::{SseDecoder, SseEvent};
use crate::api::{ApiClient, ApiError};
use crate::model::FeedItem;

const EVENTS_CHANNEL_CAPACITY: usize = 256;

/// Normalized inbound push.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// A created or updated item, to be merged like any other source
    Upsert(FeedItem),
    /// The stream came back after a drop; events in between were missed
    Reconnected,
}

#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Long-lived subscription to the backend push stream.
///
/// `connect` spawns a task that holds the stream open and reconnects with
/// capped exponential backoff. Decoded events fan out to every receiver
/// from [`RealtimeBridge::subscribe`].
pub struct RealtimeBridge {
    client: ApiClient,
    config: StreamConfig,
    events_tx: broadcast::Sender<PushEvent>,
    running: Mutex<Option<CancellationToken>>,
}

impl RealtimeBridge {
    pub fn new(client: ApiClient, config: StreamConfig) -> Self {
        let (events_tx, _) = broadcast::channel(EVENTS_CHANNEL_CAPACITY);
        Self {
            client,
            config,
            events_tx,
            running: Mutex::new(None),
        }
    }

    /// Receiver for push events. Dropping it unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.events_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.running
            .lock()
            .map(|r| r.as_ref().is_some_and(|t| !t.is_cancelled()))
            .unwrap_or(false)
    }

    /// Start the stream task. A second call while running is a no-op.
    pub fn connect(&self) {
        let Ok(mut running) = self.running.lock() else {
            return;
        };
        if running.as_ref().is_some_and(|t| !t.is_cancelled()) {
            return;
        }

        let token = CancellationToken::new();
        *running = Some(token.clone());

        let client = self.client.clone();
        let config = self.config;
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            run_stream(client, config, tx, token).await;
        });
    }

    pub fn disconnect(&self) {
        if let Ok(mut running) = self.running.lock() {
            if let Some(token) = running.take() {
                token.cancel();
                tracing::info!("Realtime stream disconnected");
            }
        }
    }
}

impl Drop for RealtimeBridge {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn run_stream(
    client: ApiClient,
    config: StreamConfig,
    tx: broadcast::Sender<PushEvent>,
    token: CancellationToken,
) {
    let mut backoff = config.initial_backoff;
    let mut attempted_before = false;

    loop {
        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = stream_once(&client, &tx, attempted_before) => result,
        };
        attempted_before = true;

        match result {
            Ok(delivered) => {
                if delivered > 0 {
                    backoff = config.initial_backoff;
                }
                tracing::info!(delivered = delivered, "Realtime stream closed by server");
            }
            Err(e) => {
                tracing::warn!(error = %e, retry_in_ms = backoff.as_millis() as u64, "Realtime stream failed");
            }
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(config.max_backoff);
    }
}

/// Hold one connection open until the server closes it. Returns the number
/// of events delivered.
async fn stream_once(
    client: &ApiClient,
    tx: &broadcast::Sender<PushEvent>,
    is_reconnect: bool,
) -> Result<usize, ApiError> {
    let url = client.stream_url()?;
    let response = client
        .authorize(client.http().get(url))
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(ApiError::HttpStatus {
            status: status.as_u16(),
            message: None,
        });
    }

    if is_reconnect {
        tracing::info!("Realtime stream reconnected");
        let _ = tx.send(PushEvent::Reconnected);
    } else {
        tracing::info!("Realtime stream connected");
    }

    let mut decoder = SseDecoder::default();
    let mut delivered = 0;
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        for event in decoder.push(&chunk?) {
            if let Some(push) = decode_event(&event) {
                delivered += 1;
                let _ = tx.send(push);
            }
        }
    }

    Ok(delivered)
}

/// Map a raw event to a push. Unknown names and malformed payloads are
/// logged and dropped.
pub(crate) fn decode_event(event: &SseEvent) -> Option<PushEvent> {
    match event.event.as_str() {
        "post.created" | "post.updated" => match serde_json::from_str::<FeedItem>(&event.data) {
            Ok(item) => Some(PushEvent::Upsert(item)),
            Err(e) => {
                tracing::warn!(event = %event.event, error = %e, "Skipping malformed push event");
                None
            }
        },
        "ping" | "heartbeat" => None,
        other => {
            tracing::debug!(event = %other, "Skipping unknown push event");
            None
        }
    }
}
