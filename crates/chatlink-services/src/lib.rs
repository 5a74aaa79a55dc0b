//! Chatlink external collaborators
//!
//! The connection manager talks to four systems it does not own:
//! - the auth service (token validation and refresh)
//! - the user directory (secondary identity check after accept)
//! - the unified message manager (semantic validation and dispatch)
//! - the agent processor (business handling of user/agent messages)
//!
//! Each is a trait object so the composition root can pick an adapter and
//! tests can substitute fakes.

pub mod agent;
pub mod auth;
pub mod directory;
pub mod error;
pub mod unified;

pub use agent::{AgentProcessor, HttpAgentProcessor, LoggingAgentProcessor};
pub use auth::{AuthService, HttpAuthService};
pub use directory::{AcceptAllDirectory, PostgresUserDirectory, UserDirectory, UserRecord};
pub use error::{ManagerError, ServiceError};
pub use unified::{LocalUnifiedManager, UnifiedManager};
