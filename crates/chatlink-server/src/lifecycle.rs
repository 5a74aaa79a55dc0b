//! ConnectionManager: drives one connection from handshake to teardown.
//!
//! ```text
//! authenticate()                 (before the upgrade is accepted)
//! run_connection()
//!   identity check  ──reject──►  close 1008 / 1011
//!   register + connect to message manager
//!   spawn refresh + heartbeat, send connection_established
//!   receive loop
//!   teardown: stop tasks → registry remove → message manager disconnect
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chatlink_protocol::{
    CloseCode, ConnectionEstablished, ConnectionLimits, ConnectionStats, DiscoveryInfo,
    ErrorPayload, PROTOCOL_VERSION, ServerMessage, SessionInfo,
};
use chatlink_services::{AgentProcessor, AuthService, UnifiedManager, UserDirectory};
use chrono::Utc;
use futures_util::{FutureExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, instrument, warn};

use crate::config::ManagerConfig;
use crate::connection::{Connection, ConnectionStatus, InboundFrame, Outbound, TransportError};
use crate::dispatcher::MessageDispatcher;
use crate::heartbeat::run_heartbeat;
use crate::identity::IdentityCheck;
use crate::refresh::{RefreshSettings, run_token_refresh};
use crate::registry::ConnectionRegistry;
use crate::validator::{AuthError, TokenValidator};

/// External systems the manager talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub auth: Arc<dyn AuthService>,
    pub directory: Arc<dyn UserDirectory>,
    pub unified: Arc<dyn UnifiedManager>,
    pub agent: Arc<dyn AgentProcessor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// Closed before registration (identity check or message manager).
    Rejected { close_code: u16 },
    /// The client closed the socket or went away.
    ClientClosed,
    /// The server ended the session (eviction or token expiry).
    ServerClosed,
    ErrorLimit,
}

/// What happened on a connection, returned when it is torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub connection_id: Option<String>,
    pub user_id: String,
    pub messages: u64,
    pub errors: u64,
    pub exit: SessionExit,
}

pub struct ConnectionManager {
    config: ManagerConfig,
    registry: Arc<ConnectionRegistry>,
    validator: TokenValidator,
    identity: IdentityCheck,
    dispatcher: MessageDispatcher,
    auth: Arc<dyn AuthService>,
    unified: Arc<dyn UnifiedManager>,
}

impl ConnectionManager {
    pub fn new(
        config: ManagerConfig,
        registry: Arc<ConnectionRegistry>,
        collaborators: Collaborators,
    ) -> Self {
        let Collaborators {
            auth,
            directory,
            unified,
            agent,
        } = collaborators;

        Self {
            validator: TokenValidator::new(auth.clone(), config.auth_call_timeout),
            identity: IdentityCheck::new(
                directory,
                config.identity_retries,
                config.identity_backoff,
                config.environment,
            ),
            dispatcher: MessageDispatcher::new(
                unified.clone(),
                agent,
                config.limits.max_message_size,
            ),
            auth,
            unified,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn limits(&self) -> ConnectionLimits {
        self.config.limits
    }

    pub fn stats(&self) -> ConnectionStats {
        self.registry.stats()
    }

    pub fn discovery(&self, instance_id: &str) -> DiscoveryInfo {
        DiscoveryInfo {
            protocol_version: PROTOCOL_VERSION.to_string(),
            features: self.config.features,
            limits: self.config.limits,
            stats: self.stats(),
            instance_id: instance_id.to_string(),
        }
    }

    /// Validate the handshake token. Called before the socket is accepted.
    pub async fn authenticate(&self, token: Option<&str>) -> Result<SessionInfo, AuthError> {
        self.validator.validate(token).await
    }

    /// Run an accepted connection to completion.
    ///
    /// `outbound` feeds the socket's writer task; `inbound` yields frames read
    /// from the socket. Teardown has completed by the time this returns.
    #[instrument(skip_all, fields(user = %session.user_id))]
    pub async fn run_connection<S>(
        &self,
        session: SessionInfo,
        outbound: mpsc::Sender<Outbound>,
        inbound: S,
    ) -> SessionSummary
    where
        S: Stream<Item = Result<InboundFrame, TransportError>> + Unpin + Send,
    {
        let user_id = session.user_id.clone();

        if let Err(e) = self.identity.verify(&user_id).await {
            warn!("Identity check for {user_id} failed: {e}");
            let close_code = e.close_code();
            let _ = outbound
                .send(Outbound::Close {
                    code: close_code,
                    reason: e.close_reason().to_string(),
                })
                .await;
            return SessionSummary {
                connection_id: None,
                user_id,
                messages: 0,
                errors: 0,
                exit: SessionExit::Rejected { close_code },
            };
        }

        let has_expiry = session.token_expires.is_some();
        let conn = self.registry.add(session, outbound).await;

        let exit = match self.unified.connect(conn.id(), &user_id).await {
            Ok(()) => {
                self.start_background_tasks(&conn, has_expiry);
                self.send_welcome(&conn).await;
                self.receive_loop(&conn, inbound).await
            }
            Err(e) => {
                warn!("Message manager refused {}: {e}", conn.id());
                let _ = conn
                    .close(CloseCode::INTERNAL_ERROR, "Message manager unavailable")
                    .await;
                SessionExit::Rejected {
                    close_code: CloseCode::INTERNAL_ERROR,
                }
            }
        };

        self.teardown(&conn).await;

        let summary = SessionSummary {
            connection_id: Some(conn.id().to_string()),
            user_id,
            messages: conn.message_count(),
            errors: conn.error_count(),
            exit,
        };
        info!(
            "Connection {} closed ({:?}): {} messages, {} errors",
            conn.id(),
            summary.exit,
            summary.messages,
            summary.errors
        );
        summary
    }

    fn start_background_tasks(&self, conn: &Arc<Connection>, has_expiry: bool) {
        if has_expiry {
            let settings = RefreshSettings {
                buffer: self.config.refresh_buffer,
                grace: self.config.expiry_grace,
                call_timeout: self.config.auth_call_timeout,
            };
            let task = run_token_refresh(
                conn.clone(),
                self.registry.clone(),
                self.auth.clone(),
                settings,
                conn.task_cancellation(),
            );
            let id = conn.id().to_string();
            conn.attach_task(tokio::spawn(async move {
                let outcome = task.await;
                debug!("Token refresh for {id} ended: {outcome:?}");
            }));
        }

        let task = run_heartbeat(
            conn.clone(),
            self.registry.clone(),
            self.config.heartbeat_interval(),
            conn.task_cancellation(),
        );
        let id = conn.id().to_string();
        conn.attach_task(tokio::spawn(async move {
            let result = task.await;
            debug!("Heartbeat for {id} ended: {result:?}");
        }));
    }

    async fn send_welcome(&self, conn: &Connection) {
        let welcome = ServerMessage::ConnectionEstablished(ConnectionEstablished {
            user_id: conn.user_id().to_string(),
            connection_id: conn.id().to_string(),
            server_time: Utc::now().to_rfc3339(),
            features: self.config.features,
            limits: self.config.limits,
        });
        if let Err(e) = conn.send(&welcome).await {
            warn!("Failed to send welcome to {}: {e}", conn.id());
        }
    }

    async fn receive_loop<S>(&self, conn: &Arc<Connection>, mut inbound: S) -> SessionExit
    where
        S: Stream<Item = Result<InboundFrame, TransportError>> + Unpin + Send,
    {
        let closed = conn.close_signal();
        let timeout_secs = self.config.receive_timeout.as_secs();
        let mut consecutive_errors: u32 = 0;

        loop {
            let next = tokio::select! {
                biased;
                () = closed.cancelled() => return SessionExit::ServerClosed,
                next = time::timeout(self.config.receive_timeout, inbound.next()) => next,
            };

            let frame = match next {
                Err(_) => {
                    debug!("No message from {} in {timeout_secs}s", conn.id());
                    let notice = ServerMessage::Error(ErrorPayload::message_timeout(timeout_secs));
                    if let Err(e) = conn.send(&notice).await {
                        debug!("Could not deliver timeout notice to {}: {e}", conn.id());
                    }
                    continue;
                }
                Ok(None) | Ok(Some(Err(TransportError::Disconnected))) => {
                    return SessionExit::ClientClosed;
                }
                Ok(Some(Err(e))) => {
                    warn!("Receive error on {}: {e}", conn.id());
                    conn.record_error();
                    consecutive_errors += 1;
                    if consecutive_errors >= self.config.max_consecutive_errors {
                        self.fail_session(conn).await;
                        return SessionExit::ErrorLimit;
                    }
                    time::sleep(self.config.error_pause).await;
                    continue;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            conn.touch();
            let handled = match frame {
                InboundFrame::Text(text) => {
                    conn.record_message();
                    self.dispatcher.process_text(conn, &text).await
                }
                InboundFrame::Binary(bytes) => {
                    conn.record_message();
                    self.dispatcher.process_binary(conn, bytes).await
                }
                InboundFrame::Ping | InboundFrame::Pong => continue,
                InboundFrame::Close => return SessionExit::ClientClosed,
            };

            match handled {
                Ok(()) => consecutive_errors = 0,
                Err(code) => {
                    consecutive_errors += 1;
                    debug!(
                        "{code} on {} ({consecutive_errors} consecutive)",
                        conn.id()
                    );
                    if consecutive_errors >= self.config.max_consecutive_errors {
                        self.fail_session(conn).await;
                        return SessionExit::ErrorLimit;
                    }
                }
            }
        }
    }

    async fn fail_session(&self, conn: &Connection) {
        warn!(
            "Connection {} hit {} consecutive errors, closing",
            conn.id(),
            self.config.max_consecutive_errors
        );
        let fatal = ErrorPayload::error_limit_exceeded(self.config.max_consecutive_errors);
        if let Err(e) = conn.send(&ServerMessage::Error(fatal)).await {
            debug!("Could not deliver error limit notice to {}: {e}", conn.id());
        }
        let _ = conn
            .close(CloseCode::POLICY_VIOLATION, "Too many errors")
            .await;
    }

    /// Each step runs regardless of the others.
    async fn teardown(&self, conn: &Arc<Connection>) {
        conn.set_status(ConnectionStatus::Closing);

        conn.shutdown_tasks().await;

        self.registry.remove(conn.user_id(), conn.id()).await;

        let disconnected = AssertUnwindSafe(self.unified.disconnect(conn.id()))
            .catch_unwind()
            .await;
        match disconnected {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Message manager disconnect of {} failed: {e}", conn.id()),
            Err(_) => warn!("Message manager disconnect of {} panicked", conn.id()),
        }

        conn.set_status(ConnectionStatus::Closed);
    }
}
