//! Collaborator adapter tests: HTTP auth client against a fake auth service,
//! the local message manager's payload rules, and the fallback adapters.

use chatlink_protocol::{ClientMessage, ForwardedMessage};
use serde_json::{Value, json};

fn forwarded(raw: Value) -> ForwardedMessage {
    let kind = raw["type"].as_str().unwrap().to_string();
    match ClientMessage::classify(&kind, raw) {
        ClientMessage::Forward(msg) => msg,
        other => panic!("not a forwarded message: {other:?}"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HttpAuthService
// ─────────────────────────────────────────────────────────────────────────────

mod http_auth {
    use std::time::Duration;

    use axum::{
        Json, Router,
        http::{HeaderMap, StatusCode, header::AUTHORIZATION},
        response::{IntoResponse, Response},
        routing::post,
    };
    use chatlink_services::{AuthService, HttpAuthService, ServiceError};
    use serde_json::{Value, json};

    async fn validate(headers: HeaderMap) -> Response {
        match headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            Some("Bearer good") => Json(json!({
                "valid": true,
                "user_id": "user-1",
                "email": "user@example.com",
                "permissions": ["chat", "agents"],
                "expires_at": "2030-01-01T00:00:00Z",
            }))
            .into_response(),
            Some("Bearer boom") => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            _ => StatusCode::UNAUTHORIZED.into_response(),
        }
    }

    async fn refresh(Json(body): Json<Value>) -> Response {
        match body["token"].as_str() {
            Some("good") => Json(json!({
                "success": true,
                "new_token": "fresh",
                "expires_at": 1_900_000_000,
            }))
            .into_response(),
            Some("empty") => Json(json!({ "success": true })).into_response(),
            _ => StatusCode::FORBIDDEN.into_response(),
        }
    }

    async fn start_fake_auth() -> String {
        let app = Router::new()
            .route("/validate", post(validate))
            .route("/refresh", post(refresh));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    fn client(base: &str) -> HttpAuthService {
        HttpAuthService::new(base, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn valid_token_returns_identity() {
        let base = start_fake_auth().await;
        let v = client(&base).validate_token("good").await.unwrap();
        assert!(v.valid);
        assert_eq!(v.user_id.as_deref(), Some("user-1"));
        assert_eq!(v.permissions.len(), 2);
        assert!(v.expires_at.is_some());
    }

    #[tokio::test]
    async fn unauthorized_is_invalid_not_error() {
        let base = start_fake_auth().await;
        let v = client(&base).validate_token("bad").await.unwrap();
        assert!(!v.valid);
        assert!(v.user_id.is_none());
    }

    #[tokio::test]
    async fn server_error_is_service_error() {
        let base = start_fake_auth().await;
        let err = client(&base).validate_token("boom").await.unwrap_err();
        assert!(matches!(err, ServiceError::Http(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn refresh_returns_new_token() {
        let base = start_fake_auth().await;
        let r = client(&base).refresh_token("good").await.unwrap();
        assert_eq!(r.issued_token(), Some("fresh"));
        assert!(r.expires_at.is_some());
    }

    #[tokio::test]
    async fn refused_refresh_is_invalid() {
        let base = start_fake_auth().await;
        let r = client(&base).refresh_token("revoked").await.unwrap();
        assert!(!r.valid);
        assert_eq!(r.issued_token(), None);
    }

    #[tokio::test]
    async fn refresh_without_token_is_invalid_response() {
        let base = start_fake_auth().await;
        let err = client(&base).refresh_token("empty").await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidResponse { service: "auth", .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn unreachable_service_is_transient() {
        // Port 9 (discard) is not listening on the loopback interface.
        let err = client("http://127.0.0.1:9").validate_token("good").await.unwrap_err();
        assert!(err.is_transient());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LocalUnifiedManager
// ─────────────────────────────────────────────────────────────────────────────

mod unified {
    use super::*;
    use chatlink_services::{LocalUnifiedManager, ManagerError, UnifiedManager};

    #[tokio::test]
    async fn connect_and_disconnect_track_connections() {
        let mgr = LocalUnifiedManager::new();
        mgr.connect("c1", "u1").await.unwrap();
        mgr.connect("c2", "u1").await.unwrap();
        assert_eq!(mgr.connection_count(), 2);
        assert!(mgr.is_connected("c1"));

        mgr.disconnect("c1").await.unwrap();
        assert!(!mgr.is_connected("c1"));
        // Disconnecting twice is harmless
        mgr.disconnect("c1").await.unwrap();
        assert_eq!(mgr.connection_count(), 1);
    }

    #[tokio::test]
    async fn counts_handled_messages() {
        let mgr = LocalUnifiedManager::new();
        mgr.connect("c1", "u1").await.unwrap();
        let msg = forwarded(json!({"type": "typing", "payload": {"active": true}}));
        mgr.handle_message("c1", "u1", &msg).await.unwrap();
        mgr.handle_message("c1", "u1", &msg).await.unwrap();
        assert_eq!(mgr.messages_handled("c1"), Some(2));
    }

    #[tokio::test]
    async fn non_object_payload_is_validation_error() {
        let mgr = LocalUnifiedManager::new();
        mgr.connect("c1", "u1").await.unwrap();
        let msg = forwarded(json!({"type": "typing", "payload": [1, 2]}));
        match mgr.handle_message("c1", "u1", &msg).await {
            Err(ManagerError::Validation { code, .. }) => {
                assert_eq!(code.as_deref(), Some("INVALID_PAYLOAD"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn user_message_requires_content() {
        let mgr = LocalUnifiedManager::new();
        mgr.connect("c1", "u1").await.unwrap();

        let blank = forwarded(json!({"type": "user_message", "payload": {"content": "   "}}));
        let err = mgr.handle_message("c1", "u1", &blank).await.unwrap_err();
        assert!(matches!(err, ManagerError::Validation { .. }));

        let ok = forwarded(json!({"type": "user_message", "payload": {"content": "hello"}}));
        mgr.handle_message("c1", "u1", &ok).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_connection_is_rejected() {
        let mgr = LocalUnifiedManager::new();
        let msg = forwarded(json!({"type": "typing"}));
        let err = mgr.handle_message("ghost", "u1", &msg).await.unwrap_err();
        assert!(matches!(err, ManagerError::UnknownConnection(id) if id == "ghost"));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fallback adapters
// ─────────────────────────────────────────────────────────────────────────────

mod fallbacks {
    use super::*;
    use chatlink_services::{
        AcceptAllDirectory, AgentProcessor, LoggingAgentProcessor, UserDirectory, UserRecord,
    };

    #[tokio::test]
    async fn accept_all_directory_reports_active_users() {
        let record = AcceptAllDirectory.lookup("u42").await.unwrap();
        assert_eq!(record, Some(UserRecord::active("u42")));
    }

    #[tokio::test]
    async fn logging_agent_processor_accepts_everything() {
        LoggingAgentProcessor
            .process("c1", "u1", &json!({"type": "agent_request"}))
            .await
            .unwrap();
    }
}
