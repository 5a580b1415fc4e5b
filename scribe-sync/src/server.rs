//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐  /documents/{id}?token=..&scope=..
//!            ├── upgrade + authenticate ── SyncSession ──┐
//! Client B ──┘                                          │
//!                                                       ▼
//!                                              DocumentService
//!                                                │     │     │
//!                               DocumentCache ◄──┘     │     └──► ConnectionRegistry
//!                                     │                │              (fan-out)
//!                                     ▼                ▼
//!                                DocumentStore ◄── PersistenceScheduler
//!
//! Client C ── /events?scope=..&token=.. ── lifecycle events (JSON text)
//! ```
//!
//! Credentials are verified inside the upgrade callback. A rejected client
//! still completes the upgrade and is then closed right away with 4001 or
//! 4003, so browsers can read the close code.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::auth::{AuthError, Authenticator, Credentials, Identity, StaticTokenAuthenticator};
use crate::protocol::close_code;
use crate::service::DocumentService;
use crate::session::SyncSession;

/// What an upgrade request asked for, decided from its path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionKind {
    /// `/documents/{id}`
    Sync { doc_id: String },
    /// `/events`
    Events,
}

impl ConnectionKind {
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.trim_end_matches('/');
        if path == "/events" {
            return Some(ConnectionKind::Events);
        }
        let doc_id = path.strip_prefix("/documents/")?;
        if doc_id.is_empty() || doc_id.contains('/') {
            return None;
        }
        Some(ConnectionKind::Sync {
            doc_id: doc_id.to_string(),
        })
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    service: Arc<DocumentService>,
    authenticator: Arc<dyn Authenticator>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    pub fn new(service: Arc<DocumentService>, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            service,
            authenticator,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Server using the static token table from the service's config.
    pub fn with_static_tokens(service: Arc<DocumentService>) -> Self {
        let tokens = service.config().auth_tokens.clone();
        Self::new(service, Arc::new(StaticTokenAuthenticator::new(tokens)))
    }

    pub fn service(&self) -> &Arc<DocumentService> {
        &self.service
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.service.config().bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let service = self.service.clone();
            let authenticator = self.authenticator.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                stats.total_connections.fetch_add(1, Ordering::Relaxed);
                stats.active_connections.fetch_add(1, Ordering::Relaxed);
                if let Err(e) =
                    Self::handle_connection(stream, addr, service, authenticator, &stats).await
                {
                    log::debug!("Connection error from {addr}: {e}");
                }
                stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    /// Upgrade, authenticate and dispatch one connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        service: Arc<DocumentService>,
        authenticator: Arc<dyn Authenticator>,
        stats: &AtomicServerStats,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let mut admitted: Option<(Option<ConnectionKind>, Result<Identity, AuthError>)> = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let kind = ConnectionKind::from_path(request.uri().path());
            let credentials = Credentials::from_request(request);
            admitted = Some((kind, authenticator.authenticate(&credentials)));
            Ok(response)
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

        let Some((kind, auth)) = admitted else {
            return Ok(());
        };
        let Some(kind) = kind else {
            stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
            return close(ws, close_code::NOT_FOUND, "unknown endpoint").await;
        };
        let identity = match auth {
            Ok(identity) => identity,
            Err(e) => {
                log::info!("Rejected connection from {addr}: {e}");
                stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
                return close(ws, e.close_code(), &e.to_string()).await;
            }
        };

        match kind {
            ConnectionKind::Sync { doc_id } => {
                match service.open_session(&doc_id, &identity).await {
                    Ok(document) => {
                        log::info!("{} connected to document {doc_id} from {addr}", identity.user_id);
                        let (session, outbound) =
                            SyncSession::open(service, document, identity).await;
                        session.run(ws, outbound).await;
                        Ok(())
                    }
                    Err(e) => {
                        log::info!("Refused sync for document {doc_id} from {addr}: {e}");
                        stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
                        close(ws, e.close_code(), &e.to_string()).await
                    }
                }
            }
            ConnectionKind::Events => run_events(ws, service, identity).await,
        }
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.stats.rejected_connections.load(Ordering::Relaxed),
        }
    }
}

/// Forward lifecycle events of the caller's scope as JSON text frames.
async fn run_events(
    ws: WebSocketStream<TcpStream>,
    service: Arc<DocumentService>,
    identity: Identity,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let (mut sink, mut stream) = ws.split();
    let mut events = service.subscribe_events();
    log::info!("{} subscribed to events of scope {}", identity.user_id, identity.scope_id);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if event.scope_id() != identity.scope_id {
                        continue;
                    }
                    match serde_json::to_string(&event) {
                        Ok(json) => sink.send(Message::Text(json.into())).await?,
                        Err(e) => log::error!("Failed to encode event: {e}"),
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    log::warn!("Event subscriber {} lagged by {n} events", identity.user_id);
                }
                Err(RecvError::Closed) => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                _ => {}
            },
        }
    }
    Ok(())
}

async fn close(
    mut ws: WebSocketStream<TcpStream>,
    code: u16,
    reason: &str,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    ws.close(Some(frame)).await
}
