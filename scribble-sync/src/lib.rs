//! # scribble-sync — shared-whiteboard synchronization
//!
//! The server holds the authoritative collection of drawn figures and
//! pushes incremental changes to every connected client; each client
//! keeps a local mirror that applies those changes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ ClientMirror │ ◄─────────────────► │  SyncServer  │
//! │  (per user)  │    Binary Proto     │  (central)   │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ FigureStore  │                     │ FigureStore  │
//! │   (local)    │                     │ (authority)  │
//! └──────────────┘                     └──────┬───────┘
//!                                             │
//!                                  ┌──────────┴──────────┐
//!                                  │ SubscriberRegistry  │
//!                                  │      (fan-out)      │
//!                                  └─────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire protocol (bincode-encoded frames)
//! - [`store`] — keyed figure collection with stable z-order
//! - [`registry`] — subscriber fan-out with prune-on-failure
//! - [`server`] — the authoritative WebSocket server
//! - [`mirror`] — client mirror with local selection state
//!
//! Ids are assigned by the server only; change notifications carry an
//! explicit `Added | Updated | Removed` tag; delivery is best effort
//! per recipient, with the full snapshot on connect as the only
//! consistency backstop.

pub mod protocol;
pub mod store;
pub mod registry;
pub mod server;
pub mod mirror;

// Re-exports for convenience
pub use protocol::{Change, ChangeKind, ClientRequest, ServerMessage, SyncError};
pub use store::FigureStore;
pub use registry::{RegistryStats, SubscriberRegistry};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use mirror::{ClientMirror, ConnectionState, MirrorConfig, MirrorEvent};
