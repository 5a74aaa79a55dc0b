//! Chatlink server core: owns every live WebSocket connection.
//!
//! The core is transport-agnostic: a connection is an outbound
//! `mpsc::Sender<Outbound>` drained by a single writer task plus a stream of
//! [`InboundFrame`]s. The transport crate adapts axum sockets to that shape.
//!
//! Per connection the [`ConnectionManager`] runs the receive loop itself and
//! spawns two background tasks (token refresh, heartbeat) that are cancelled
//! and awaited during teardown.

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod heartbeat;
pub mod identity;
pub mod lifecycle;
pub mod refresh;
pub mod registry;
pub mod validator;

pub use config::{Environment, ManagerConfig};
pub use connection::{Connection, ConnectionStatus, InboundFrame, Outbound, TransportError};
pub use dispatcher::MessageDispatcher;
pub use heartbeat::HeartbeatResult;
pub use identity::{IdentityCheck, IdentityError};
pub use lifecycle::{Collaborators, ConnectionManager, SessionExit, SessionSummary};
pub use refresh::{RefreshOutcome, RefreshSettings};
pub use registry::ConnectionRegistry;
pub use validator::{AuthError, TokenValidator};
