//! Binary wire protocol for figure synchronization.
//!
//! Every frame is a bincode-encoded enum. Client-to-server traffic is
//! request/response, correlated by a per-connection `seq` counter;
//! server-to-client change notifications are fire-and-forget pushes
//! with no seq and no acknowledgment.
//!
//! The change notification carries an explicit tag
//! (`Added | Updated | Removed`) so mirrors never have to infer the
//! intent of a push from its payload shape.

use scribble_core::{Figure, FigureId};
use serde::{Deserialize, Serialize};

/// The kind of a replicated change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Updated,
    Removed,
}

/// One replicated change, as pushed to subscribers.
///
/// Removal carries only the id: the subscriber may never have seen the
/// figure, and deleting an unknown id is a no-op on the mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    Added(Figure),
    Updated(Figure),
    Removed(FigureId),
}

impl Change {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::Added(_) => ChangeKind::Added,
            Change::Updated(_) => ChangeKind::Updated,
            Change::Removed(_) => ChangeKind::Removed,
        }
    }

    /// Id of the figure this change concerns.
    pub fn figure_id(&self) -> FigureId {
        match self {
            Change::Added(f) | Change::Updated(f) => f.id,
            Change::Removed(id) => *id,
        }
    }
}

/// Requests a client sends to the server.
///
/// `seq` is a client-chosen correlation number echoed back in the
/// matching response; it has no meaning to the server beyond that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientRequest {
    /// Connection handshake, naming the service the client expects to
    /// find at this address.
    Hello { seq: u64, service: String },
    /// Commit a figure; the server assigns the id if unassigned.
    AddFigure { seq: u64, figure: Figure },
    /// Replace the figure with the same id.
    UpdateFigure { seq: u64, figure: Figure },
    /// Remove the figure with the given id.
    RemoveFigure { seq: u64, id: FigureId },
    /// Full snapshot of the authoritative collection.
    GetFigures { seq: u64 },
    /// Register this connection for change notifications.
    Subscribe { seq: u64 },
}

impl ClientRequest {
    pub fn seq(&self) -> u64 {
        match self {
            ClientRequest::Hello { seq, .. }
            | ClientRequest::AddFigure { seq, .. }
            | ClientRequest::UpdateFigure { seq, .. }
            | ClientRequest::RemoveFigure { seq, .. }
            | ClientRequest::GetFigures { seq }
            | ClientRequest::Subscribe { seq } => *seq,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::Encode(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        let (req, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| SyncError::Decode(e.to_string()))?;
        Ok(req)
    }
}

/// Frames the server sends to a client: responses (with `seq`) and
/// change notifications (without).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Handshake accepted.
    HelloAck { seq: u64 },
    /// The committed figure, with its canonical server-assigned id.
    FigureAdded { seq: u64, figure: Figure },
    /// `applied` is false when no figure with that id exists — a
    /// normal result value, not a failure.
    UpdateAck { seq: u64, applied: bool },
    /// The removed figure, or `None` if it was already absent.
    FigureRemoved { seq: u64, figure: Option<Figure> },
    /// Point-in-time snapshot, in z-order.
    Figures { seq: u64, figures: Vec<Figure> },
    /// Subscription registered.
    Subscribed { seq: u64 },
    /// The request was refused (e.g. service name mismatch).
    Error { seq: u64, message: String },
    /// Push notification of a committed change by another client.
    Notify { change: Change },
}

impl ServerMessage {
    /// Correlation number, if this is a response frame.
    pub fn seq(&self) -> Option<u64> {
        match self {
            ServerMessage::HelloAck { seq }
            | ServerMessage::FigureAdded { seq, .. }
            | ServerMessage::UpdateAck { seq, .. }
            | ServerMessage::FigureRemoved { seq, .. }
            | ServerMessage::Figures { seq, .. }
            | ServerMessage::Subscribed { seq }
            | ServerMessage::Error { seq, .. } => Some(*seq),
            ServerMessage::Notify { .. } => None,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::Encode(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| SyncError::Decode(e.to_string()))?;
        Ok(msg)
    }
}

/// Errors of the sync layer.
///
/// Not-found outcomes are *not* errors — they are value-level results
/// (`UpdateAck { applied: false }`, `FigureRemoved { figure: None }`).
#[derive(Debug, Clone)]
pub enum SyncError {
    Encode(String),
    Decode(String),
    /// The transport dropped before or during the call; the mutation
    /// is not confirmed and must not be retained as committed.
    ConnectionClosed,
    /// `connect` was called on a mirror that is already connecting or
    /// connected.
    AlreadyConnected,
    /// No response arrived within the request deadline.
    Timeout,
    /// The server answered with a frame the call did not expect.
    UnexpectedResponse,
    /// The server refused the request.
    Refused(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::AlreadyConnected => write!(f, "already connected"),
            Self::Timeout => write!(f, "request timed out"),
            Self::UnexpectedResponse => write!(f, "unexpected response frame"),
            Self::Refused(m) => write!(f, "refused by server: {m}"),
        }
    }
}

impl std::error::Error for SyncError {}
