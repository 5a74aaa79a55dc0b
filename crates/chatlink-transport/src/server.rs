//! HTTP/WebSocket server using Axum.
//!
//! The bearer token is checked before the upgrade is accepted: a bad token
//! gets a plain 401 and the WebSocket handshake never completes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use axum_server::tls_rustls::RustlsConfig;
use chatlink_server::ConnectionManager;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::socket::serve_socket;

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Transport server configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Hostname to bind to
    pub hostname: String,
    /// Allow cross-origin requests (browser clients on another origin)
    pub enable_cors: bool,
    /// Serve `wss://` with these PEM files
    pub tls: Option<TlsConfig>,
    /// Outbound frames queued per connection before senders wait
    pub outbound_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            hostname: "127.0.0.1".into(),
            enable_cors: false,
            tls: None,
            outbound_buffer: 256,
        }
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("invalid bind address: {0}")]
    Address(#[from] std::net::AddrParseError),

    #[error("failed to bind or load TLS material: {0}")]
    Io(#[from] std::io::Error),
}

struct AppState {
    manager: Arc<ConnectionManager>,
    config: TransportConfig,
    instance_id: String,
}

pub struct TransportServer {
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
    port: u16,
    tls: bool,
    instance_id: String,
}

impl TransportServer {
    pub async fn start(
        config: TransportConfig,
        manager: Arc<ConnectionManager>,
    ) -> Result<Self, StartError> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let instance_id = uuid::Uuid::new_v4().to_string();

        let state = Arc::new(AppState {
            manager,
            config: config.clone(),
            instance_id: instance_id.clone(),
        });

        let mut app = Router::new()
            .route("/ws", get(ws_upgrade_handler))
            .route("/ws/info", get(discovery_handler))
            .route("/health", get(health_handler))
            .with_state(state)
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));
        if config.enable_cors {
            app = app.layer(CorsLayer::permissive());
        }

        let addr: SocketAddr = format!("{}:{}", config.hostname, config.port).parse()?;

        let (handle, actual_port) = match &config.tls {
            None => {
                let listener = tokio::net::TcpListener::bind(addr).await?;
                let port = listener.local_addr()?.port();
                let handle = tokio::spawn(async move {
                    let served = axum::serve(listener, app)
                        .with_graceful_shutdown(async move {
                            let _ = shutdown_rx.recv().await;
                        })
                        .await;
                    if let Err(e) = served {
                        error!("Transport server failed: {e}");
                    }
                });
                (handle, port)
            }
            Some(tls) => {
                let rustls = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path).await?;
                let listener = std::net::TcpListener::bind(addr)?;
                listener.set_nonblocking(true)?;
                let port = listener.local_addr()?.port();

                let server_handle = axum_server::Handle::new();
                let shutdown_handle = server_handle.clone();
                tokio::spawn(async move {
                    let _ = shutdown_rx.recv().await;
                    shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
                });

                let handle = tokio::spawn(async move {
                    let served = axum_server::from_tcp_rustls(listener, rustls)
                        .handle(server_handle)
                        .serve(app.into_make_service())
                        .await;
                    if let Err(e) = served {
                        error!("Transport server failed: {e}");
                    }
                });
                (handle, port)
            }
        };

        let scheme = if config.tls.is_some() { "wss" } else { "ws" };
        info!(
            "Chatlink transport listening on {scheme}://{}:{actual_port}/ws",
            config.hostname
        );

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            port: actual_port,
            tls: config.tls.is_some(),
            instance_id,
        })
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Stop accepting connections and wait for the server task.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("Chatlink transport stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ConnectParams {
    token: Option<String>,
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let session = match state.manager.authenticate(params.token.as_deref()).await {
        Ok(session) => session,
        Err(e) if e.is_unauthorized() => {
            debug!("Upgrade refused: {e}");
            return (StatusCode::UNAUTHORIZED, Json(json!({ "error": e.to_string() })))
                .into_response();
        }
        Err(e) => {
            warn!("Upgrade refused, auth service unavailable: {e}");
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": "authentication service unavailable" })),
            )
                .into_response();
        }
    };

    let user_id = session.user_id.clone();
    ws.on_upgrade(move |socket| async move {
        let summary = serve_socket(
            socket,
            session,
            state.manager.clone(),
            state.config.outbound_buffer,
        )
        .await;
        debug!("Socket for {user_id} finished: {:?}", summary.exit);
    })
    .into_response()
}

async fn discovery_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.manager.discovery(&state.instance_id))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.manager.stats().total_connections,
    }))
}
