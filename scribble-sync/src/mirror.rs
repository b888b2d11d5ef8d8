//! Client-side mirror of the authoritative figure collection.
//!
//! The mirror is what local collaborators (canvas, hit-testing) read;
//! it is seeded with a full snapshot on connect and then only moves
//! forward on change notifications. Local edits go to the server
//! first — the mirror commits the authoritative reply, never the
//! pre-call draft.
//!
//! Selection is per-client UI state. It lives in a side table keyed by
//! figure id, never on the wire, so a remote update to a figure's
//! geometry or color cannot clobber a local selection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use scribble_core::{Figure, FigureId};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use crate::protocol::{Change, ClientRequest, ServerMessage, SyncError};
use crate::store::FigureStore;

/// Mirror connection configuration.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Server URL, e.g. `ws://127.0.0.1:9400`
    pub server_url: String,
    /// Discovery name the server must answer to
    pub service_name: String,
    /// Deadline for each request/response round trip
    pub request_timeout: Duration,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9400".to_string(),
            service_name: "figures".to_string(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Mirror connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted to the embedding application.
#[derive(Debug, Clone)]
pub enum MirrorEvent {
    /// Connected, subscribed, and seeded from the server snapshot.
    Connected,
    /// Connection lost; the mirror no longer advances.
    Disconnected,
    /// A remote change was applied to the local collection.
    RemoteChange(Change),
}

type PendingMap = HashMap<u64, oneshot::Sender<ServerMessage>>;

/// The client mirror.
pub struct ClientMirror {
    config: MirrorConfig,
    /// Local copy of the figure collection.
    figures: Arc<Mutex<FigureStore>>,
    /// Locally selected figure ids — never replicated.
    selection: Arc<Mutex<HashSet<FigureId>>>,
    state: Arc<RwLock<ConnectionState>>,
    /// Bumped on every `connect` so tasks of an earlier connection
    /// cannot touch the state of a later one.
    epoch: Arc<AtomicU64>,
    /// Next request correlation number.
    seq: AtomicU64,
    /// In-flight requests awaiting their response frame.
    pending: Arc<Mutex<PendingMap>>,
    /// Channel to the WebSocket writer task.
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_tx: mpsc::Sender<MirrorEvent>,
    event_rx: Option<mpsc::Receiver<MirrorEvent>>,
}

impl ClientMirror {
    pub fn new(config: MirrorConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            config,
            figures: Arc::new(Mutex::new(FigureStore::new())),
            selection: Arc::new(Mutex::new(HashSet::new())),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            epoch: Arc::new(AtomicU64::new(0)),
            seq: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<MirrorEvent>> {
        self.event_rx.take()
    }

    /// Connect, perform the handshake, subscribe for notifications,
    /// and seed the local collection with the server's snapshot.
    ///
    /// Only valid while disconnected; calling it again on a live or
    /// half-open connection returns [`SyncError::AlreadyConnected`].
    pub async fn connect(&mut self) -> Result<(), SyncError> {
        {
            let mut state = self.state.write().await;
            if *state != ConnectionState::Disconnected {
                return Err(SyncError::AlreadyConnected);
            }
            *state = ConnectionState::Connecting;
        }
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let ws_result = tokio_tungstenite::connect_async(&self.config.server_url).await;
        let ws_stream = match ws_result {
            Ok((stream, _)) => stream,
            Err(e) => {
                log::warn!("Connect to {} failed: {e}", self.config.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(SyncError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward pre-encoded frames to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        // Reader task: route responses to pending requests, apply
        // snapshots and notifications to the local collection in the
        // order they arrive.
        let pending = self.pending.clone();
        let figures = self.figures.clone();
        let selection = self.selection.clone();
        let state = self.state.clone();
        let epoch_counter = self.epoch.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match ServerMessage::decode(&bytes) {
                            Ok(frame) => {
                                route_frame(frame, &pending, &figures, &selection, &event_tx)
                                    .await;
                            }
                            Err(e) => log::warn!("Undecodable server frame: {e}"),
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost: fail all in-flight requests — unless a
            // newer connection took over while this socket wound down.
            if epoch_counter.load(Ordering::SeqCst) == epoch {
                pending.lock().await.clear();
                *state.write().await = ConnectionState::Disconnected;
                let _ = event_tx.send(MirrorEvent::Disconnected).await;
            }
        });

        if let Err(e) = self.handshake().await {
            self.outgoing_tx = None;
            *self.state.write().await = ConnectionState::Disconnected;
            return Err(e);
        }

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(MirrorEvent::Connected).await;
        log::info!("Mirror connected to {}", self.config.server_url);
        Ok(())
    }

    /// Hello, subscribe, then request the seeding snapshot. The reader
    /// task commits the snapshot when its frame arrives, so a change
    /// the server queued behind it can never be applied ahead of it.
    async fn handshake(&self) -> Result<(), SyncError> {
        let service = self.config.service_name.clone();
        match self
            .request(|seq| ClientRequest::Hello { seq, service })
            .await?
        {
            ServerMessage::HelloAck { .. } => {}
            ServerMessage::Error { message, .. } => return Err(SyncError::Refused(message)),
            _ => return Err(SyncError::UnexpectedResponse),
        }

        // Subscribe before seeding: changes committed between the two
        // calls arrive as notifications and upsert idempotently.
        match self.request(|seq| ClientRequest::Subscribe { seq }).await? {
            ServerMessage::Subscribed { .. } => {}
            _ => return Err(SyncError::UnexpectedResponse),
        }

        match self.request(|seq| ClientRequest::GetFigures { seq }).await? {
            ServerMessage::Figures { .. } => Ok(()),
            _ => Err(SyncError::UnexpectedResponse),
        }
    }

    /// Send one request and await its correlated response.
    async fn request(
        &self,
        build: impl FnOnce(u64) -> ClientRequest,
    ) -> Result<ServerMessage, SyncError> {
        let out_tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(SyncError::ConnectionClosed)?;

        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, tx);

        let encoded = build(seq).encode()?;
        if out_tx.send(encoded).await.is_err() {
            self.pending.lock().await.remove(&seq);
            return Err(SyncError::ConnectionClosed);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(SyncError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&seq);
                Err(SyncError::Timeout)
            }
        }
    }

    /// Commit a locally drawn figure.
    ///
    /// Returns the authoritative figure with its server-assigned id;
    /// that figure, not the draft, is what enters the local mirror. On
    /// any transport failure the draft must be treated as uncommitted.
    pub async fn add_figure(&self, draft: Figure) -> Result<Figure, SyncError> {
        match self
            .request(|seq| ClientRequest::AddFigure { seq, figure: draft })
            .await?
        {
            ServerMessage::FigureAdded { figure, .. } => {
                self.figures.lock().await.upsert(figure.clone());
                Ok(figure)
            }
            ServerMessage::Error { message, .. } => Err(SyncError::Refused(message)),
            _ => Err(SyncError::UnexpectedResponse),
        }
    }

    /// Replace a figure's geometry/color/appearance.
    ///
    /// Returns whether the server applied it; `false` means the id is
    /// unknown there (a reported no-op, not an error) and the local
    /// mirror is left untouched.
    pub async fn update_figure(&self, figure: Figure) -> Result<bool, SyncError> {
        let figure = figure.normalized();
        let committed = figure.clone();
        match self
            .request(|seq| ClientRequest::UpdateFigure { seq, figure })
            .await?
        {
            ServerMessage::UpdateAck { applied, .. } => {
                if applied {
                    self.figures.lock().await.upsert(committed);
                }
                Ok(applied)
            }
            ServerMessage::Error { message, .. } => Err(SyncError::Refused(message)),
            _ => Err(SyncError::UnexpectedResponse),
        }
    }

    /// Remove a figure. Returns the removed figure as known to the
    /// server, or `None` if it was already absent.
    pub async fn remove_figure(&self, id: FigureId) -> Result<Option<Figure>, SyncError> {
        match self
            .request(|seq| ClientRequest::RemoveFigure { seq, id })
            .await?
        {
            ServerMessage::FigureRemoved { figure, .. } => {
                self.figures.lock().await.remove(id);
                self.selection.lock().await.remove(&id);
                Ok(figure)
            }
            ServerMessage::Error { message, .. } => Err(SyncError::Refused(message)),
            _ => Err(SyncError::UnexpectedResponse),
        }
    }

    /// Re-fetch the full snapshot from the server and replace the
    /// local collection with it. The replacement happens on the reader
    /// task, in order with any notifications around it; the returned
    /// count is the snapshot's size.
    pub async fn refresh(&self) -> Result<usize, SyncError> {
        match self.request(|seq| ClientRequest::GetFigures { seq }).await? {
            ServerMessage::Figures { figures, .. } => Ok(figures.len()),
            _ => Err(SyncError::UnexpectedResponse),
        }
    }

    /// Snapshot of the local collection, in z-order.
    pub async fn figures(&self) -> Vec<Figure> {
        self.figures.lock().await.snapshot()
    }

    pub async fn figure(&self, id: FigureId) -> Option<Figure> {
        self.figures.lock().await.get(id).cloned()
    }

    pub async fn contains(&self, id: FigureId) -> bool {
        self.figures.lock().await.contains(id)
    }

    pub async fn len(&self) -> usize {
        self.figures.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.figures.lock().await.is_empty()
    }

    /// Mark a figure as locally selected. Returns false if the figure
    /// is not in the mirror.
    pub async fn select(&self, id: FigureId) -> bool {
        if !self.figures.lock().await.contains(id) {
            return false;
        }
        self.selection.lock().await.insert(id);
        true
    }

    pub async fn deselect(&self, id: FigureId) -> bool {
        self.selection.lock().await.remove(&id)
    }

    pub async fn is_selected(&self, id: FigureId) -> bool {
        self.selection.lock().await.contains(&id)
    }

    /// Ids of the locally selected figures.
    pub async fn selected(&self) -> Vec<FigureId> {
        self.selection.lock().await.iter().copied().collect()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }
}

/// Route one decoded server frame: commit `Figures` snapshots to the
/// local collection first, then hand seq-carrying frames to their
/// pending request and apply notifications.
///
/// Running entirely on the reader task keeps the store in wire order:
/// a notification the server queued after a snapshot is applied after
/// the snapshot, never before.
async fn route_frame(
    frame: ServerMessage,
    pending: &Mutex<PendingMap>,
    figures: &Mutex<FigureStore>,
    selection: &Mutex<HashSet<FigureId>>,
    event_tx: &mpsc::Sender<MirrorEvent>,
) {
    if let ServerMessage::Figures {
        figures: snapshot, ..
    } = &frame
    {
        figures.lock().await.reset(snapshot.clone());
    }
    match frame.seq() {
        Some(seq) => {
            let responder = pending.lock().await.remove(&seq);
            match responder {
                Some(tx) => {
                    let _ = tx.send(frame);
                }
                None => log::debug!("Orphan response for seq {seq}"),
            }
        }
        None => {
            if let ServerMessage::Notify { change } = frame {
                apply_change(figures, selection, &change).await;
                let _ = event_tx.send(MirrorEvent::RemoteChange(change)).await;
            }
        }
    }
}

/// Apply one remote change to the local collection.
///
/// `Added` and `Updated` are the same uniform upsert; `Removed`
/// deletes the entry (a no-op for an unknown id) and drops any local
/// selection of it. Selection of other figures is untouched.
async fn apply_change(
    figures: &Mutex<FigureStore>,
    selection: &Mutex<HashSet<FigureId>>,
    change: &Change,
) {
    match change {
        Change::Added(figure) | Change::Updated(figure) => {
            figures.lock().await.upsert(figure.clone());
        }
        Change::Removed(id) => {
            figures.lock().await.remove(*id);
            selection.lock().await.remove(id);
        }
    }
}
