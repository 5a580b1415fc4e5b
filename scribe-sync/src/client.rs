//! WebSocket sync client.
//!
//! Keeps a local [`CrdtDocument`] replica in step with a document on the
//! server:
//! - answers the server's SyncStep1 and sends its own
//! - applies incoming SyncStep2 / Update frames to the replica
//! - sends local edits as Update frames
//! - relays awareness payloads both ways
//!
//! Used by the integration tests and by Rust front ends.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::document::{CrdtDocument, DocumentError, LocalEdit};
use crate::protocol::{Message, ProtocolError, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket open, handshake not finished
    Connected,
    /// Server state received
    Synced,
}

/// Events emitted by the sync client, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Connected,
    /// Server asked for our missing state
    SyncRequested,
    /// Server state merged into the replica
    StateSynced,
    /// Incremental update from another participant
    RemoteUpdate(Vec<u8>),
    /// Awareness payload relayed by the server
    Awareness(Vec<u8>),
    /// Connection closed, with the close code if the server sent one
    Disconnected { code: Option<u16>, reason: String },
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

const EVENT_CAPACITY: usize = 1024;

/// Build a sync endpoint URL with credentials in the query string.
pub fn document_url(base: &str, doc_id: &str, token: &str, scope: &str) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("token", token)
        .append_pair("scope", scope)
        .finish();
    format!("{}/documents/{doc_id}?{query}", base.trim_end_matches('/'))
}

/// The sync client.
pub struct SyncClient {
    replica: Arc<Mutex<CrdtDocument>>,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: mpsc::Sender<WsMessage>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    text_rx: watch::Receiver<String>,
    closed_rx: watch::Receiver<Option<(Option<u16>, String)>>,
}

impl SyncClient {
    /// Connect to `url` and start the handshake.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let replica = Arc::new(Mutex::new(CrdtDocument::new()));
        let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(256);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (text_tx, text_rx) = watch::channel(String::new());
        let (closed_tx, closed_rx) = watch::channel(None);

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        *state.write().await = ConnectionState::Connected;
        let _ = event_tx.try_send(SyncEvent::Connected);

        // Our half of the handshake
        let step1 = Message::sync_step1(replica.lock().await.current_state_vector()).encode();
        out_tx
            .send(WsMessage::Binary(step1.into()))
            .await
            .map_err(|_| ClientError::Closed)?;

        // Reader task: apply incoming frames to the replica
        {
            let replica = replica.clone();
            let state = state.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let mut close = (None, String::new());
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(WsMessage::Binary(data)) => {
                            let event = match handle_frame(&replica, &out_tx, &data).await {
                                Ok(event) => event,
                                Err(e) => {
                                    log::warn!("Client dropped malformed frame: {e}");
                                    continue;
                                }
                            };
                            if event == SyncEvent::StateSynced {
                                *state.write().await = ConnectionState::Synced;
                            }
                            let text = replica.lock().await.materialize();
                            text_tx.send_replace(text);
                            let _ = event_tx.try_send(event);
                        }
                        Ok(WsMessage::Close(frame)) => {
                            if let Some(frame) = frame {
                                close = (Some(u16::from(frame.code)), frame.reason.as_str().to_string());
                            }
                            break;
                        }
                        Err(_) => break,
                        _ => {}
                    }
                }

                *state.write().await = ConnectionState::Disconnected;
                let _ = event_tx.try_send(SyncEvent::Disconnected {
                    code: close.0,
                    reason: close.1.clone(),
                });
                closed_tx.send_replace(Some(close));
            });
        }

        Ok(Self {
            replica,
            state,
            outgoing_tx: out_tx,
            event_rx: Some(event_rx),
            text_rx,
            closed_rx,
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Insert text at a byte offset and send the update.
    pub async fn insert(&self, index: u32, text: &str) -> Result<(), ClientError> {
        self.edit(LocalEdit::Insert {
            index,
            text: text.to_string(),
        })
        .await
    }

    /// Delete `len` bytes at `index` and send the update.
    pub async fn delete(&self, index: u32, len: u32) -> Result<(), ClientError> {
        self.edit(LocalEdit::Delete { index, len }).await
    }

    /// Apply any local edit and send the resulting update.
    pub async fn edit(&self, edit: LocalEdit) -> Result<(), ClientError> {
        let delta = self.replica.lock().await.apply_local_edit(edit)?;
        if let Some(delta) = delta {
            self.send(Message::update(delta)).await?;
        }
        Ok(())
    }

    /// Send a raw awareness payload.
    pub async fn send_awareness(&self, payload: Vec<u8>) -> Result<(), ClientError> {
        self.send(Message::awareness(payload)).await
    }

    /// Send an already encoded frame as is.
    pub async fn send_raw(&self, frame: Vec<u8>) -> Result<(), ClientError> {
        self.outgoing_tx
            .send(WsMessage::Binary(frame.into()))
            .await
            .map_err(|_| ClientError::Closed)
    }

    async fn send(&self, message: Message) -> Result<(), ClientError> {
        self.send_raw(message.encode()).await
    }

    /// Current text of the local replica.
    pub async fn text(&self) -> String {
        self.replica.lock().await.materialize()
    }

    /// Wait until the replica's text equals `expected`.
    pub async fn wait_for_text(&self, expected: &str, timeout: Duration) -> Result<(), ClientError> {
        let mut rx = self.text_rx.clone();
        let wait = async {
            loop {
                if self.replica.lock().await.materialize() == expected {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(ClientError::Closed);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ClientError::Timeout("text"))?
    }

    /// Wait until the server's state has been merged.
    pub async fn wait_synced(&self, timeout: Duration) -> Result<(), ClientError> {
        let wait = async {
            loop {
                match *self.state.read().await {
                    ConnectionState::Synced => return Ok(()),
                    ConnectionState::Disconnected => return Err(ClientError::Closed),
                    _ => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ClientError::Timeout("sync"))?
    }

    /// Wait for the connection to close; returns the server's close code.
    pub async fn wait_closed(&self, timeout: Duration) -> Result<Option<u16>, ClientError> {
        let mut rx = self.closed_rx.clone();
        let wait = async {
            loop {
                if let Some((code, _)) = rx.borrow_and_update().as_ref() {
                    return *code;
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ClientError::Timeout("close"))
    }

    /// Send a normal close frame.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.outgoing_tx
            .send(WsMessage::Close(None))
            .await
            .map_err(|_| ClientError::Closed)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }
}

async fn handle_frame(
    replica: &Mutex<CrdtDocument>,
    out_tx: &mpsc::Sender<WsMessage>,
    data: &[u8],
) -> Result<SyncEvent, ClientError> {
    let event = match Message::decode(data)? {
        Message::Sync(SyncMessage::SyncStep1(state_vector)) => {
            let diff = replica.lock().await.diff_since(&state_vector)?;
            let reply = Message::sync_step2(diff).encode();
            out_tx
                .send(WsMessage::Binary(reply.into()))
                .await
                .map_err(|_| ClientError::Closed)?;
            SyncEvent::SyncRequested
        }
        Message::Sync(SyncMessage::SyncStep2(delta)) => {
            replica.lock().await.apply_remote_update(&delta)?;
            SyncEvent::StateSynced
        }
        Message::Sync(SyncMessage::Update(delta)) => {
            replica.lock().await.apply_remote_update(&delta)?;
            SyncEvent::RemoteUpdate(delta)
        }
        Message::Awareness(payload) => SyncEvent::Awareness(payload),
    };
    Ok(event)
}
