//! Per-connection sync protocol state machine.
//!
//! ```text
//! Connecting ──► Authenticating ──► AwaitingSync ──► Open ──► Closed
//!                 (upgrade callback)   │ server sent Step1
//!                                      │ Open on peer Step2,
//!                                      │ or after answering peer Step1
//! ```
//!
//! The session registers with the [`ConnectionRegistry`] before it sends
//! its SyncStep1, so no update applied after the handshake started can be
//! missed. Broadcast frames that arrive before the session is Open are held
//! back and released, in order, right after the handshake completes; a peer
//! therefore never sees an Update ahead of its own handshake.

use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::auth::Identity;
use crate::broadcast::{CloseReason, Outbound, SessionHandle, SessionReceiver};
use crate::cache::LiveDocument;
use crate::error::SyncError;
use crate::protocol::{close_code, Message, ProtocolError, SyncMessage};
use crate::service::DocumentService;

/// Protocol state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    AwaitingSync,
    Open,
    Closed,
}

/// One client connection to one document.
pub struct SyncSession {
    id: Uuid,
    identity: Identity,
    document: Arc<LiveDocument>,
    service: Arc<DocumentService>,
    state: SessionState,
}

impl SyncSession {
    /// Register a new session on `document` and return it with its queue.
    pub async fn open(
        service: Arc<DocumentService>,
        document: Arc<LiveDocument>,
        identity: Identity,
    ) -> (SyncSession, SessionReceiver) {
        let id = Uuid::new_v4();
        let (handle, receiver) = SessionHandle::channel(service.config().outbound_capacity);
        service
            .registry()
            .register(document.id(), id, handle)
            .await;
        log::info!(
            "Session {id} ({}) joined document {}",
            identity.user_id,
            document.id()
        );
        let session = SyncSession {
            id,
            identity,
            document,
            service,
            state: SessionState::AwaitingSync,
        };
        (session, receiver)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn document_id(&self) -> &str {
        self.document.id()
    }

    /// The server's SyncStep1 carrying its current state vector.
    pub async fn handshake(&self) -> Vec<u8> {
        let state_vector = self.document.state().lock().await.current_state_vector();
        Message::sync_step1(state_vector).encode()
    }

    /// Process one inbound binary frame; returns frames to send back.
    ///
    /// An error means the frame was malformed; the caller closes the
    /// connection with [`SyncError::close_code`].
    pub async fn handle_frame(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, SyncError> {
        let mut replies = Vec::new();
        match Message::decode(bytes)? {
            Message::Sync(SyncMessage::SyncStep1(state_vector)) => {
                let diff = self.document.state().lock().await.diff_since(&state_vector)?;
                log::debug!("Session {} answered SyncStep1 ({} bytes)", self.id, diff.len());
                replies.push(Message::sync_step2(diff).encode());
                self.mark_open(&mut replies).await;
            }
            Message::Sync(SyncMessage::SyncStep2(delta)) => {
                self.service
                    .apply_wire_update(&self.document, self.id, &delta)
                    .await?;
                self.mark_open(&mut replies).await;
            }
            Message::Sync(SyncMessage::Update(delta)) => {
                log::debug!("Session {} sent update ({} bytes)", self.id, delta.len());
                self.service
                    .apply_wire_update(&self.document, self.id, &delta)
                    .await?;
            }
            Message::Awareness(payload) => {
                let changed = self
                    .service
                    .presence()
                    .apply(self.document.id(), self.id, &payload)
                    .await?;
                log::trace!(
                    "Session {} awareness: {changed} entries changed",
                    self.id
                );
                self.service
                    .registry()
                    .broadcast(self.document.id(), Arc::new(bytes.to_vec()), Some(self.id))
                    .await;
            }
        }
        Ok(replies)
    }

    async fn mark_open(&mut self, replies: &mut Vec<Vec<u8>>) {
        if self.state != SessionState::AwaitingSync {
            return;
        }
        self.state = SessionState::Open;
        log::debug!("Session {} is open", self.id);
        if let Some(snapshot) = self.service.presence().snapshot(self.document.id()).await {
            replies.push(Message::awareness(snapshot).encode());
        }
    }

    /// Deregister and retract this session's presence.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;

        let doc_id = self.document.id();
        let remaining = self.service.registry().deregister(doc_id, &self.id).await;
        let presence = self.service.presence();
        if let Some(removal) = presence.remove_session(doc_id, &self.id).await {
            let frame = Arc::new(Message::awareness(removal).encode());
            self.service.registry().broadcast(doc_id, frame, None).await;
        }
        if remaining == 0 {
            presence.drop_document(doc_id).await;
        }
        log::info!(
            "Session {} left document {doc_id} ({remaining} remaining)",
            self.id
        );
    }

    /// Drive the session over a WebSocket until either side closes.
    pub async fn run<S>(mut self, ws: WebSocketStream<S>, mut outbound: SessionReceiver)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = ws.split();
        let capacity = self.service.config().outbound_capacity;
        let mut held: VecDeque<Arc<Vec<u8>>> = VecDeque::new();

        let step1 = self.handshake().await;
        let mut close = match sink.send(WsMessage::Binary(step1.into())).await {
            Ok(()) => None,
            Err(e) => {
                log::debug!("Session {} handshake send failed: {e}", self.id);
                self.close().await;
                return;
            }
        };

        while close.is_none() {
            tokio::select! {
                inbound = stream.next() => match inbound {
                    Some(Ok(WsMessage::Binary(data))) => {
                        match self.handle_frame(&data).await {
                            Ok(replies) => {
                                let mut frames: Vec<Vec<u8>> = replies;
                                if self.state == SessionState::Open {
                                    frames.extend(held.drain(..).map(|f| f.to_vec()));
                                }
                                for frame in frames {
                                    if sink.send(WsMessage::Binary(frame.into())).await.is_err() {
                                        close = Some(None);
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                log::warn!("Session {} protocol violation: {e}", self.id);
                                close = Some(Some(CloseReason::new(e.close_code(), e.to_string())));
                            }
                        }
                    }
                    Some(Ok(WsMessage::Text(_))) => {
                        let e = SyncError::Protocol(ProtocolError::UnexpectedTextFrame);
                        log::warn!("Session {} protocol violation: {e}", self.id);
                        close = Some(Some(CloseReason::new(close_code::PROTOCOL_ERROR, e.to_string())));
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if sink.send(WsMessage::Pong(data)).await.is_err() {
                            close = Some(None);
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => close = Some(None),
                    Some(Err(e)) => {
                        log::debug!("Session {} socket error: {e}", self.id);
                        close = Some(None);
                    }
                    Some(Ok(_)) => {}
                },
                queued = outbound.recv() => match queued {
                    Outbound::Frame(frame) => {
                        if self.state == SessionState::Open {
                            if sink.send(WsMessage::Binary(frame.to_vec().into())).await.is_err() {
                                close = Some(None);
                            }
                        } else if held.len() >= capacity {
                            log::warn!("Session {} overflowed during handshake", self.id);
                            close = Some(Some(CloseReason::new(
                                close_code::TRY_AGAIN_LATER,
                                "outbound queue full",
                            )));
                        } else {
                            held.push_back(frame);
                        }
                    }
                    Outbound::Close(reason) => close = Some(Some(reason)),
                },
            }
        }

        self.close().await;
        if let Some(Some(reason)) = close {
            let frame = CloseFrame {
                code: CloseCode::from(reason.code),
                reason: reason.reason.into(),
            };
            let _ = sink.send(WsMessage::Close(Some(frame))).await;
        }
    }
}
