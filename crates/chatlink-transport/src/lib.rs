//! Chatlink transport layer
//!
//! Exposes the connection manager over HTTP:
//! - `GET /ws?token=…` authenticates, then upgrades to a WebSocket
//! - `GET /ws/info` describes the protocol, limits and live stats
//! - `GET /health` liveness probe
//!
//! Each accepted socket is split: a writer task owns the sink and drains an
//! `mpsc` channel, the read half is adapted into the manager's frame stream.

pub mod server;
pub mod socket;

pub use server::{StartError, TlsConfig, TransportConfig, TransportServer};
