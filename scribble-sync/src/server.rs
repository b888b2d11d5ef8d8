//! WebSocket sync server holding the authoritative figure collection.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌──► Client B (Notify)
//!            ├── SyncServer ── FigureStore
//! Client B ──┘        │                └──► Client C (Notify)
//!                     └── SubscriberRegistry
//! ```
//!
//! One task per connection. Each request mutates the store under a
//! single lock, replies to the caller, then fans the change out to
//! every *other* subscriber with the lock already released — a slow or
//! dead subscriber can never stall another client's mutation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use scribble_core::FigureId;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{Change, ClientRequest, ServerMessage, SyncError};
use crate::registry::SubscriberRegistry;
use crate::store::FigureStore;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Discovery name clients must present in their handshake
    pub service_name: String,
    /// Outbound channel capacity per connection
    pub channel_capacity: usize,
    /// Per-subscriber notification delivery timeout
    pub delivery_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9400".to_string(),
            service_name: "figures".to_string(),
            channel_capacity: 256,
            delivery_timeout: Duration::from_secs(3),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub figures_added: u64,
    pub figures_updated: u64,
    pub figures_removed: u64,
}

/// Shared state behind every connection task.
struct ServerState {
    config: ServerConfig,
    /// Authoritative collection; all mutations serialize through here.
    store: Mutex<FigureStore>,
    registry: SubscriberRegistry,
    /// Figure id allocator. Ids are authoritative only once assigned
    /// here; client drafts arrive with the unassigned placeholder.
    next_id: AtomicU64,
    stats: RwLock<ServerStats>,
}

/// The sync server.
pub struct SyncServer {
    state: Arc<ServerState>,
}

impl SyncServer {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let delivery_timeout = config.delivery_timeout;
        Self {
            state: Arc::new(ServerState {
                config,
                store: Mutex::new(FigureStore::new()),
                registry: SubscriberRegistry::new(delivery_timeout),
                next_id: AtomicU64::new(1),
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Start listening for WebSocket connections.
    ///
    /// Runs the accept loop; call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        log::info!(
            "Sync server '{}' listening on {}",
            self.state.config.service_name,
            self.state.config.bind_addr
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(state, stream).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.state.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.state.config.bind_addr
    }

    /// Number of figures currently in the authoritative store.
    pub async fn figure_count(&self) -> usize {
        self.state.store.lock().await.len()
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    state: Arc<ServerState>,
    stream: TcpStream,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let conn_id = Uuid::new_v4();
    log::info!("Connection {conn_id} established");

    {
        let mut s = state.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    // Single writer per socket: responses and fan-out notifications
    // both flow through this channel. The registry holds a clone of
    // the sender once the client subscribes.
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(state.config.channel_capacity);
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let encoded = match msg.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::error!("Dropping unencodable frame: {e}");
                    continue;
                }
            };
            if ws_sender.send(Message::Binary(encoded.into())).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session::new(conn_id);

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                let bytes: Vec<u8> = data.into();
                match ClientRequest::decode(&bytes) {
                    Ok(req) => {
                        if let Err(e) = session.handle(&state, req, &out_tx).await {
                            log::warn!("Connection {conn_id} closing: {e}");
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!("Undecodable request on {conn_id}: {e}");
                    }
                }
            }
            Ok(Message::Close(_)) => {
                log::info!("Connection {conn_id} closed by peer");
                break;
            }
            Ok(_) => {} // text/ping/pong are not part of the protocol
            Err(e) => {
                log::error!("WebSocket error on {conn_id}: {e}");
                break;
            }
        }
    }

    // Cleanup: drop the subscription and the writer.
    state.registry.remove(&conn_id).await;
    drop(out_tx);
    let _ = writer.await;

    {
        let mut s = state.stats.write().await;
        s.active_connections -= 1;
    }
    log::info!("Connection {conn_id} finished");
    Ok(())
}

/// Per-connection request dispatcher.
///
/// Kept separate from the socket plumbing so the operation semantics
/// are testable without a network.
struct Session {
    conn_id: Uuid,
    greeted: bool,
}

impl Session {
    fn new(conn_id: Uuid) -> Self {
        Self {
            conn_id,
            greeted: false,
        }
    }

    async fn handle(
        &mut self,
        state: &Arc<ServerState>,
        req: ClientRequest,
        out_tx: &mpsc::Sender<ServerMessage>,
    ) -> Result<(), SyncError> {
        {
            let mut s = state.stats.write().await;
            s.total_requests += 1;
        }

        let seq = req.seq();
        if !self.greeted && !matches!(req, ClientRequest::Hello { .. }) {
            self.reply(
                out_tx,
                ServerMessage::Error {
                    seq,
                    message: "handshake required".to_string(),
                },
            )
            .await?;
            return Ok(());
        }

        match req {
            ClientRequest::Hello { seq, service } => {
                if service != state.config.service_name {
                    self.reply(
                        out_tx,
                        ServerMessage::Error {
                            seq,
                            message: format!("unknown service '{service}'"),
                        },
                    )
                    .await?;
                    return Err(SyncError::Refused(service));
                }
                self.greeted = true;
                self.reply(out_tx, ServerMessage::HelloAck { seq }).await
            }

            ClientRequest::AddFigure { seq, figure } => {
                let mut figure = figure.normalized();
                if !figure.id.is_assigned() {
                    figure.id = FigureId(state.next_id.fetch_add(1, Ordering::SeqCst));
                }

                let inserted = {
                    let mut store = state.store.lock().await;
                    store.add(figure.clone())
                };

                // Duplicate submissions are absorbed; the caller still
                // gets the canonical figure back.
                self.reply(
                    out_tx,
                    ServerMessage::FigureAdded {
                        seq,
                        figure: figure.clone(),
                    },
                )
                .await?;

                if inserted {
                    log::info!("Figure added: {figure}");
                    {
                        let mut s = state.stats.write().await;
                        s.figures_added += 1;
                    }
                    state
                        .registry
                        .broadcast(Change::Added(figure), Some(self.conn_id))
                        .await;
                } else {
                    log::debug!("Duplicate add absorbed: {}", figure.id);
                }
                Ok(())
            }

            ClientRequest::UpdateFigure { seq, figure } => {
                let figure = figure.normalized();
                let applied = {
                    let mut store = state.store.lock().await;
                    store.update(figure.clone())
                };

                self.reply(out_tx, ServerMessage::UpdateAck { seq, applied })
                    .await?;

                if applied {
                    log::info!("Figure updated: {figure}");
                    {
                        let mut s = state.stats.write().await;
                        s.figures_updated += 1;
                    }
                    state
                        .registry
                        .broadcast(Change::Updated(figure), Some(self.conn_id))
                        .await;
                } else {
                    log::debug!("Update of unknown figure {}", figure.id);
                }
                Ok(())
            }

            ClientRequest::RemoveFigure { seq, id } => {
                let removed = {
                    let mut store = state.store.lock().await;
                    store.remove(id)
                };

                self.reply(
                    out_tx,
                    ServerMessage::FigureRemoved {
                        seq,
                        figure: removed.clone(),
                    },
                )
                .await?;

                if removed.is_some() {
                    log::info!("Figure removed: {id}");
                    let mut s = state.stats.write().await;
                    s.figures_removed += 1;
                } else {
                    log::debug!("Remove of unknown figure {id}");
                }

                // Mirrors are idempotent to removal of an unknown id,
                // so the notification goes out either way.
                state
                    .registry
                    .broadcast(Change::Removed(id), Some(self.conn_id))
                    .await;
                Ok(())
            }

            ClientRequest::GetFigures { seq } => {
                let figures = {
                    let store = state.store.lock().await;
                    store.snapshot()
                };
                self.reply(out_tx, ServerMessage::Figures { seq, figures })
                    .await
            }

            ClientRequest::Subscribe { seq } => {
                state.registry.register(self.conn_id, out_tx.clone()).await;
                self.reply(out_tx, ServerMessage::Subscribed { seq }).await
            }
        }
    }

    async fn reply(
        &self,
        out_tx: &mpsc::Sender<ServerMessage>,
        msg: ServerMessage,
    ) -> Result<(), SyncError> {
        out_tx
            .send(msg)
            .await
            .map_err(|_| SyncError::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribble_core::{Figure, Rgb, ShapeKind};

    fn test_state() -> Arc<ServerState> {
        let config = ServerConfig {
            delivery_timeout: Duration::from_millis(200),
            ..ServerConfig::default()
        };
        let delivery_timeout = config.delivery_timeout;
        Arc::new(ServerState {
            config,
            store: Mutex::new(FigureStore::new()),
            registry: SubscriberRegistry::new(delivery_timeout),
            next_id: AtomicU64::new(1),
            stats: RwLock::new(ServerStats::default()),
        })
    }

    async fn greeted_session(
        state: &Arc<ServerState>,
    ) -> (Session, mpsc::Sender<ServerMessage>, mpsc::Receiver<ServerMessage>) {
        let mut session = Session::new(Uuid::new_v4());
        let (tx, mut rx) = mpsc::channel(32);
        session
            .handle(
                state,
                ClientRequest::Hello {
                    seq: 0,
                    service: "figures".to_string(),
                },
                &tx,
            )
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), ServerMessage::HelloAck { seq: 0 });
        (session, tx, rx)
    }

    fn draft() -> Figure {
        let mut f = Figure::new(ShapeKind::Circle, Rgb::new(0, 0, 139), 10.0, 10.0);
        f.width = 20.0;
        f.height = 20.0;
        f
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9400");
        assert_eq!(config.service_name, "figures");
        assert_eq!(config.channel_capacity, 256);
        assert_eq!(config.delivery_timeout, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_server_initial_state() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9400");
        assert_eq!(server.figure_count().await, 0);
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.figures_added, 0);
    }

    #[tokio::test]
    async fn test_hello_wrong_service_refused() {
        let state = test_state();
        let mut session = Session::new(Uuid::new_v4());
        let (tx, mut rx) = mpsc::channel(8);

        let result = session
            .handle(
                &state,
                ClientRequest::Hello {
                    seq: 1,
                    service: "not-figures".to_string(),
                },
                &tx,
            )
            .await;
        assert!(result.is_err());
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerMessage::Error { seq: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_request_before_hello_rejected() {
        let state = test_state();
        let mut session = Session::new(Uuid::new_v4());
        let (tx, mut rx) = mpsc::channel(8);

        session
            .handle(&state, ClientRequest::GetFigures { seq: 5 }, &tx)
            .await
            .unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerMessage::Error { seq: 5, .. }
        ));
    }

    #[tokio::test]
    async fn test_add_assigns_monotonic_ids() {
        let state = test_state();
        let (mut session, tx, mut rx) = greeted_session(&state).await;

        for expected in 1..=3u64 {
            session
                .handle(
                    &state,
                    ClientRequest::AddFigure {
                        seq: expected,
                        figure: draft(),
                    },
                    &tx,
                )
                .await
                .unwrap();
            match rx.recv().await.unwrap() {
                ServerMessage::FigureAdded { figure, .. } => {
                    assert_eq!(figure.id, FigureId(expected));
                }
                other => panic!("expected FigureAdded, got {other:?}"),
            }
        }
        assert_eq!(state.store.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_add_absorbed() {
        let state = test_state();
        let (mut session, tx, mut rx) = greeted_session(&state).await;

        let figure = draft().with_id(FigureId(7));
        for seq in [1, 2] {
            session
                .handle(
                    &state,
                    ClientRequest::AddFigure {
                        seq,
                        figure: figure.clone(),
                    },
                    &tx,
                )
                .await
                .unwrap();
            assert!(matches!(
                rx.recv().await.unwrap(),
                ServerMessage::FigureAdded { .. }
            ));
        }

        assert_eq!(state.store.lock().await.len(), 1);
        assert_eq!(state.stats.read().await.figures_added, 1);
    }

    #[tokio::test]
    async fn test_add_normalizes_negative_extents() {
        let state = test_state();
        let (mut session, tx, mut rx) = greeted_session(&state).await;

        let mut figure = draft();
        figure.width = -20.0;
        session
            .handle(&state, ClientRequest::AddFigure { seq: 1, figure }, &tx)
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            ServerMessage::FigureAdded { figure, .. } => {
                assert_eq!(figure.x, -10.0);
                assert_eq!(figure.width, 20.0);
            }
            other => panic!("expected FigureAdded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_update_unknown_reports_not_applied() {
        let state = test_state();
        let (mut session, tx, mut rx) = greeted_session(&state).await;

        session
            .handle(
                &state,
                ClientRequest::UpdateFigure {
                    seq: 1,
                    figure: draft().with_id(FigureId(42)),
                },
                &tx,
            )
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            ServerMessage::UpdateAck {
                seq: 1,
                applied: false
            }
        );
        assert!(state.store.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_absent_returns_none_and_notifies() {
        let state = test_state();
        let (mut session, tx, mut rx) = greeted_session(&state).await;

        // Another subscriber to observe the notification.
        let (sub_tx, mut sub_rx) = mpsc::channel(8);
        state.registry.register(Uuid::new_v4(), sub_tx).await;

        session
            .handle(
                &state,
                ClientRequest::RemoveFigure {
                    seq: 1,
                    id: FigureId(99),
                },
                &tx,
            )
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            ServerMessage::FigureRemoved {
                seq: 1,
                figure: None
            }
        );
        // Removal is pushed even when the figure was already absent.
        assert_eq!(
            sub_rx.recv().await.unwrap(),
            ServerMessage::Notify {
                change: Change::Removed(FigureId(99))
            }
        );
    }

    #[tokio::test]
    async fn test_mutation_excludes_originator_from_fanout() {
        let state = test_state();
        let (mut session, tx, mut rx) = greeted_session(&state).await;

        // The originator is itself subscribed, plus one other client.
        session
            .handle(&state, ClientRequest::Subscribe { seq: 1 }, &tx)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), ServerMessage::Subscribed { seq: 1 });

        let (other_tx, mut other_rx) = mpsc::channel(8);
        state.registry.register(Uuid::new_v4(), other_tx).await;

        session
            .handle(
                &state,
                ClientRequest::AddFigure {
                    seq: 2,
                    figure: draft(),
                },
                &tx,
            )
            .await
            .unwrap();

        // Originator gets only its response, no echo.
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerMessage::FigureAdded { .. }
        ));
        assert!(rx.try_recv().is_err());

        // The other subscriber gets the Added notification.
        match other_rx.recv().await.unwrap() {
            ServerMessage::Notify {
                change: Change::Added(figure),
            } => assert_eq!(figure.id, FigureId(1)),
            other => panic!("expected Added notify, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_figures_snapshot_order() {
        let state = test_state();
        let (mut session, tx, mut rx) = greeted_session(&state).await;

        for seq in 1..=3 {
            session
                .handle(
                    &state,
                    ClientRequest::AddFigure {
                        seq,
                        figure: draft(),
                    },
                    &tx,
                )
                .await
                .unwrap();
            let _ = rx.recv().await.unwrap();
        }

        session
            .handle(&state, ClientRequest::GetFigures { seq: 9 }, &tx)
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            ServerMessage::Figures { figures, .. } => {
                let ids: Vec<u64> = figures.iter().map(|f| f.id.0).collect();
                assert_eq!(ids, vec![1, 2, 3]);
            }
            other => panic!("expected Figures, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_adds_both_commit() {
        let state = test_state();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                let (mut session, tx, mut rx) = greeted_session(&state).await;
                session
                    .handle(
                        &state,
                        ClientRequest::AddFigure {
                            seq: 1,
                            figure: draft(),
                        },
                        &tx,
                    )
                    .await
                    .unwrap();
                match rx.recv().await.unwrap() {
                    ServerMessage::FigureAdded { figure, .. } => figure.id,
                    other => panic!("expected FigureAdded, got {other:?}"),
                }
            }));
        }

        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8, "all assigned ids must be distinct");
        assert_eq!(state.store.lock().await.len(), 8);
    }
}
