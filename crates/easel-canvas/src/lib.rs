//! Remote canvas peer.
//!
//! A companion device runs the drawing surface and connects over a
//! WebSocket. [`PeerBroker`] correlates snapshot and export requests with
//! the peer's replies; [`SessionManager`] keeps at most one canvas live.

pub mod broker;
pub mod error;
pub mod pending;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod store;
pub mod transport;

pub use broker::{DEFAULT_EXPORT_TIMEOUT, DEFAULT_SNAPSHOT_TIMEOUT, PeerBroker, PeerConnection};
pub use error::{BrokerError, SessionError};
pub use pending::PendingRequests;
pub use protocol::Envelope;
pub use relay::SyncRelay;
pub use session::{
    CanvasSessionFactory, CanvasTimeouts, SaveOperation, Session, SessionFactory, SessionInfo,
    SessionManager,
};
pub use store::{FileWorkspaceStore, WorkspaceStore};
pub use transport::{Transport, TransportOptions, WsTransport};
