//! Change notifications from the hosted database.
//!
//! A [`ChangeSource`] hands out [`Subscription`]s. Each notice names only the
//! table and the kind of change; consumers are expected to re-fetch.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::http::ValidatedUrl;
use super::tables::Table;

pub const CHANNEL_TOPIC: &str = "realtime:public:all";
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const NOTICE_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotice {
    pub table: Table,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RealtimeError {
    #[error("invalid realtime endpoint '{url}': {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("websocket connection failed: {message}")]
    Connection { message: String },

    #[error("channel join failed: {message}")]
    Join { message: String },
}

impl RealtimeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RealtimeError::Connection { .. })
    }
}

/// Live stream of change notices. Dropping it stops the feed.
pub struct Subscription {
    notices: mpsc::Receiver<ChangeNotice>,
    task: Option<JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Subscription {
    pub fn new(
        notices: mpsc::Receiver<ChangeNotice>,
        task: JoinHandle<()>,
        shutdown: oneshot::Sender<()>,
    ) -> Self {
        Self {
            notices,
            task: Some(task),
            shutdown: Some(shutdown),
        }
    }

    /// Next notice, or `None` once the feed has ended.
    pub async fn next(&mut self) -> Option<ChangeNotice> {
        self.notices.recv().await
    }

    /// Asks the feed task to leave the channel and waits for it to finish.
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn subscribe(&self, tables: &[Table]) -> Result<Subscription, RealtimeError>;
}

// --- In-process broadcast ---

/// Fan-out of notices published by an in-process backend.
#[derive(Debug, Clone)]
pub struct BroadcastSource {
    sender: broadcast::Sender<ChangeNotice>,
}

impl Default for BroadcastSource {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastSource {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(NOTICE_BUFFER);
        Self { sender }
    }

    pub fn notify(&self, notice: ChangeNotice) {
        // No subscribers is not an error.
        let _ = self.sender.send(notice);
    }
}

#[async_trait]
impl ChangeSource for BroadcastSource {
    async fn subscribe(&self, tables: &[Table]) -> Result<Subscription, RealtimeError> {
        let mut source = self.sender.subscribe();
        let tables = tables.to_vec();
        let (tx, rx) = mpsc::channel(NOTICE_BUFFER);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            loop {
                let notice = tokio::select! {
                    _ = &mut shutdown_rx => break,
                    received = source.recv() => match received {
                        Ok(notice) if tables.contains(&notice.table) => notice,
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // One notice stands in for the dropped ones.
                            warn!(skipped, "Change feed lagged");
                            match tables.first() {
                                Some(&table) => ChangeNotice { table, kind: ChangeKind::Other },
                                None => continue,
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                if tx.send(notice).await.is_err() {
                    break;
                }
            }
        });

        Ok(Subscription::new(rx, task, shutdown_tx))
    }
}

// --- Phoenix websocket ---

/// Realtime feed over the hosted backend's Phoenix websocket protocol.
pub struct PhoenixSource {
    endpoint: Url,
    api_key: SecretString,
}

impl PhoenixSource {
    pub fn new(base: &ValidatedUrl, api_key: SecretString) -> Result<Self, RealtimeError> {
        let invalid = |reason: String| RealtimeError::InvalidEndpoint {
            url: base.as_str().to_string(),
            reason,
        };

        let mut endpoint = Url::parse(base.as_str()).map_err(|e| invalid(e.to_string()))?;
        let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
        endpoint
            .set_scheme(scheme)
            .map_err(|()| invalid(format!("cannot switch scheme to {scheme}")))?;
        let path = format!(
            "{}/realtime/v1/websocket",
            endpoint.path().trim_end_matches('/')
        );
        endpoint.set_path(&path);
        endpoint.set_query(None);

        Ok(Self { endpoint, api_key })
    }

    /// Endpoint without credentials, for logging.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn connect_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("apikey", self.api_key.expose_secret())
            .append_pair("vsn", "1.0.0");
        url
    }
}

fn join_message(tables: &[Table]) -> Value {
    let changes: Vec<Value> = tables
        .iter()
        .map(|t| json!({"event": "*", "schema": "public", "table": t.name()}))
        .collect();
    json!({
        "topic": CHANNEL_TOPIC,
        "event": "phx_join",
        "payload": {"config": {"postgres_changes": changes}},
        "ref": "1",
    })
}

fn control_message(topic: &str, event: &str, reference: u64) -> Value {
    json!({
        "topic": topic,
        "event": event,
        "payload": {},
        "ref": reference.to_string(),
    })
}

/// Extracts a notice from one inbound frame, if it is a row change.
fn parse_notice(text: &str) -> Option<ChangeNotice> {
    let frame: Value = serde_json::from_str(text).ok()?;
    if frame.get("event").and_then(Value::as_str) != Some("postgres_changes") {
        return None;
    }
    let data = frame.get("payload")?.get("data")?;
    let table = Table::from_name(data.get("table")?.as_str()?)?;
    let kind = data
        .get("type")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or(ChangeKind::Other);
    Some(ChangeNotice { table, kind })
}

fn join_error(text: &str) -> Option<String> {
    let frame: Value = serde_json::from_str(text).ok()?;
    let is_reply = frame.get("event").and_then(Value::as_str) == Some("phx_reply");
    let status = frame.pointer("/payload/status").and_then(Value::as_str);
    (is_reply && status == Some("error")).then(|| frame["payload"]["response"].to_string())
}

#[async_trait]
impl ChangeSource for PhoenixSource {
    async fn subscribe(&self, tables: &[Table]) -> Result<Subscription, RealtimeError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.connect_url().as_str())
            .await
            .map_err(|e| RealtimeError::Connection {
                message: e.to_string(),
            })?;
        let (mut sink, mut stream) = ws.split();

        sink.send(Message::Text(join_message(tables).to_string()))
            .await
            .map_err(|e| RealtimeError::Join {
                message: e.to_string(),
            })?;
        info!(endpoint = %self.endpoint, topic = CHANNEL_TOPIC, "Joined realtime channel");

        let (tx, rx) = mpsc::channel(NOTICE_BUFFER);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await;
            let mut reference: u64 = 1;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        reference += 1;
                        let leave = control_message(CHANNEL_TOPIC, "phx_leave", reference);
                        let _ = sink.send(Message::Text(leave.to_string())).await;
                        let _ = sink.close().await;
                        debug!("Left realtime channel");
                        break;
                    }
                    _ = heartbeat.tick() => {
                        reference += 1;
                        let beat = control_message("phoenix", "heartbeat", reference);
                        if let Err(e) = sink.send(Message::Text(beat.to_string())).await {
                            warn!(error = %e, "Realtime heartbeat failed");
                            break;
                        }
                    }
                    frame = stream.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reason) = join_error(&text) {
                                warn!(%reason, "Realtime channel join rejected");
                                break;
                            }
                            if let Some(notice) = parse_notice(&text) {
                                if tx.send(notice).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Realtime connection closed by server");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "Realtime connection error");
                            break;
                        }
                    },
                }
            }
        });

        Ok(Subscription::new(rx, task, shutdown_tx))
    }
}
