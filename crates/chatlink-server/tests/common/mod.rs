//! Shared fakes and a client harness for driving `ConnectionManager`.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chatlink_protocol::{ForwardedMessage, SessionInfo, TokenRefresh, TokenValidation};
use chatlink_server::{
    Collaborators, ConnectionManager, ConnectionRegistry, InboundFrame, ManagerConfig, Outbound,
    SessionSummary, TransportError,
};
use chatlink_services::{
    AgentProcessor, AuthService, ManagerError, ServiceError, UnifiedManager, UserDirectory,
    UserRecord,
};
use chrono::{TimeDelta, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

// ─────────────────────────────────────────────────────────────────────────────
// Auth service
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum RefreshBehavior {
    /// Issue `token` valid for the given number of seconds.
    Issue { token: String, ttl_secs: i64 },
    Refuse,
    Fail,
    Hang,
}

pub struct MockAuth {
    pub refresh: Mutex<RefreshBehavior>,
    pub refresh_calls: AtomicUsize,
    pub validate_calls: AtomicUsize,
}

impl MockAuth {
    pub fn new() -> Self {
        Self {
            refresh: Mutex::new(RefreshBehavior::Issue {
                token: "refreshed-token".into(),
                ttl_secs: 3600,
            }),
            refresh_calls: AtomicUsize::new(0),
            validate_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_refresh(self, behavior: RefreshBehavior) -> Self {
        *self.refresh.lock() = behavior;
        self
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthService for MockAuth {
    /// `user:<id>` tokens are valid, `down` fails, `hang` never answers.
    async fn validate_token(&self, token: &str) -> Result<TokenValidation, ServiceError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        if token == "down" {
            return Err(ServiceError::Unavailable("auth".into()));
        }
        if token == "hang" {
            std::future::pending::<()>().await;
        }
        match token.strip_prefix("user:") {
            Some(user) => Ok(TokenValidation {
                valid: true,
                user_id: Some(user.to_string()),
                email: Some(format!("{user}@example.com")),
                permissions: vec!["chat".into()],
                expires_at: Some(Utc::now() + TimeDelta::hours(1)),
                auth_method: None,
            }),
            None => Ok(TokenValidation::default()),
        }
    }

    async fn refresh_token(&self, _token: &str) -> Result<TokenRefresh, ServiceError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.refresh.lock().clone();
        match behavior {
            RefreshBehavior::Issue { token, ttl_secs } => Ok(TokenRefresh {
                valid: true,
                new_token: Some(token),
                expires_at: Some(Utc::now() + TimeDelta::seconds(ttl_secs)),
            }),
            RefreshBehavior::Refuse => Ok(TokenRefresh {
                valid: false,
                new_token: None,
                expires_at: None,
            }),
            RefreshBehavior::Fail => Err(ServiceError::Unavailable("auth".into())),
            RefreshBehavior::Hang => std::future::pending().await,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// User directory
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub enum Lookup {
    Active,
    Inactive,
    Missing,
    /// Transient failure (retried)
    Down,
    /// Permanent failure (not retried)
    Broken,
}

/// Answers from a script, then `Active` forever.
pub struct MockDirectory {
    script: Mutex<VecDeque<Lookup>>,
    pub calls: AtomicUsize,
}

impl MockDirectory {
    pub fn new(script: impl IntoIterator<Item = Lookup>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UserDirectory for MockDirectory {
    async fn lookup(&self, user_id: &str) -> Result<Option<UserRecord>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front().unwrap_or(Lookup::Active);
        match next {
            Lookup::Active => Ok(Some(UserRecord::active(user_id))),
            Lookup::Inactive => Ok(Some(UserRecord {
                user_id: user_id.to_string(),
                is_active: false,
            })),
            Lookup::Missing => Ok(None),
            Lookup::Down => Err(ServiceError::Unavailable("user directory".into())),
            Lookup::Broken => Err(ServiceError::InvalidResponse {
                service: "user directory",
                message: "schema mismatch".into(),
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message manager and agent processor
// ─────────────────────────────────────────────────────────────────────────────

/// Records everything. Message kinds with special behavior:
/// `reject_me` → validation error, `crash_me` → internal error,
/// `panic_me` → panic.
#[derive(Default)]
pub struct RecordingUnified {
    pub connected: Mutex<Vec<String>>,
    pub disconnected: Mutex<Vec<String>>,
    pub handled: Mutex<Vec<String>>,
    pub refuse_connect: Mutex<bool>,
}

impl RecordingUnified {
    pub fn handled(&self) -> Vec<String> {
        self.handled.lock().clone()
    }
}

#[async_trait]
impl UnifiedManager for RecordingUnified {
    async fn connect(&self, connection_id: &str, _user_id: &str) -> Result<(), ManagerError> {
        if *self.refuse_connect.lock() {
            return Err(ServiceError::Unavailable("message manager".into()).into());
        }
        self.connected.lock().push(connection_id.to_string());
        Ok(())
    }

    async fn disconnect(&self, connection_id: &str) -> Result<(), ManagerError> {
        self.disconnected.lock().push(connection_id.to_string());
        Ok(())
    }

    async fn handle_message(
        &self,
        _connection_id: &str,
        _user_id: &str,
        message: &ForwardedMessage,
    ) -> Result<(), ManagerError> {
        match message.kind.as_str() {
            "reject_me" => Err(ManagerError::validation("BAD_THING", "thing is bad")),
            "crash_me" => Err(ServiceError::Unavailable("storage".into()).into()),
            "panic_me" => panic!("message manager exploded"),
            kind => {
                self.handled.lock().push(kind.to_string());
                Ok(())
            }
        }
    }
}

#[derive(Default)]
pub struct RecordingAgent {
    pub received: Mutex<Vec<Value>>,
    pub fail: Mutex<bool>,
}

impl RecordingAgent {
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl AgentProcessor for RecordingAgent {
    async fn process(
        &self,
        _connection_id: &str,
        _user_id: &str,
        message: &Value,
    ) -> Result<(), ServiceError> {
        if *self.fail.lock() {
            return Err(ServiceError::Unavailable("agent pipeline".into()));
        }
        self.received.lock().push(message.clone());
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

pub struct Harness {
    pub manager: Arc<ConnectionManager>,
    pub registry: Arc<ConnectionRegistry>,
    pub auth: Arc<MockAuth>,
    pub directory: Arc<MockDirectory>,
    pub unified: Arc<RecordingUnified>,
    pub agent: Arc<RecordingAgent>,
}

pub fn harness(config: ManagerConfig) -> Harness {
    harness_with(config, MockAuth::new(), MockDirectory::new([]))
}

pub fn harness_with(config: ManagerConfig, auth: MockAuth, directory: MockDirectory) -> Harness {
    let registry = Arc::new(ConnectionRegistry::new(
        config.limits.max_connections_per_user,
    ));
    let auth = Arc::new(auth);
    let directory = Arc::new(directory);
    let unified = Arc::new(RecordingUnified::default());
    let agent = Arc::new(RecordingAgent::default());
    let manager = Arc::new(ConnectionManager::new(
        config,
        registry.clone(),
        Collaborators {
            auth: auth.clone(),
            directory: directory.clone(),
            unified: unified.clone(),
            agent: agent.clone(),
        },
    ));
    Harness {
        manager,
        registry,
        auth,
        directory,
        unified,
        agent,
    }
}

/// Session without an expiry, so no refresh task is started.
pub fn session(user_id: &str) -> SessionInfo {
    SessionInfo::new(user_id, format!("user:{user_id}"))
}

pub fn session_expiring_in(user_id: &str, secs: i64) -> SessionInfo {
    session(user_id).with_expiry(Some(Utc::now() + TimeDelta::seconds(secs)))
}

/// The client side of a connection run by the manager.
pub struct TestClient {
    pub inbound: Option<mpsc::Sender<Result<InboundFrame, TransportError>>>,
    pub outbound: mpsc::Receiver<Outbound>,
    pub task: JoinHandle<SessionSummary>,
}

pub fn connect(h: &Harness, session: SessionInfo) -> TestClient {
    let (out_tx, out_rx) = mpsc::channel(64);
    let (in_tx, in_rx) = mpsc::channel(64);
    let manager = h.manager.clone();
    let task = tokio::spawn(async move {
        manager
            .run_connection(session, out_tx, ReceiverStream::new(in_rx))
            .await
    });
    TestClient {
        inbound: Some(in_tx),
        outbound: out_rx,
        task,
    }
}

impl TestClient {
    pub async fn send_text(&self, text: &str) {
        self.send_frame(Ok(InboundFrame::Text(text.to_string()))).await;
    }

    pub async fn send_frame(&self, frame: Result<InboundFrame, TransportError>) {
        if let Some(tx) = &self.inbound {
            tx.send(frame).await.expect("connection stopped reading");
        }
    }

    /// Next outbound frame, failing the test after 10 minutes of (virtual)
    /// silence.
    pub async fn next_outbound(&mut self) -> Outbound {
        tokio::time::timeout(Duration::from_secs(600), self.outbound.recv())
            .await
            .expect("timed out waiting for outbound frame")
            .expect("outbound channel closed")
    }

    /// Next JSON message, skipping heartbeats. Panics on a close frame.
    pub async fn next_message(&mut self) -> Value {
        loop {
            match self.next_outbound().await {
                Outbound::Text(text) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["type"] != "heartbeat" {
                        return value;
                    }
                }
                Outbound::Close { code, reason } => {
                    panic!("unexpected close {code}: {reason}")
                }
            }
        }
    }

    /// Skip JSON messages until a close frame arrives.
    pub async fn expect_close(&mut self) -> (u16, String) {
        loop {
            if let Outbound::Close { code, reason } = self.next_outbound().await {
                return (code, reason);
            }
        }
    }

    pub async fn welcome(&mut self) -> Value {
        let msg = self.next_message().await;
        assert_eq!(msg["type"], "connection_established");
        msg
    }

    /// Drop the inbound side (client went away) and wait for teardown.
    pub async fn disconnect(mut self) -> SessionSummary {
        self.inbound.take();
        self.task.await.unwrap()
    }

    pub async fn finish(self) -> SessionSummary {
        self.task.await.unwrap()
    }
}
