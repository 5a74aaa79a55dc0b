//! MessageDispatcher tests: validation order, local replies, forwarding.

mod common;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chatlink_protocol::{ClientMessage, ErrorCode};
    use chatlink_server::dispatcher::parse_frame;
    use chatlink_server::{Connection, ConnectionRegistry, MessageDispatcher, Outbound};
    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    use crate::common::{RecordingAgent, RecordingUnified, session};
    use chatlink_services::UnifiedManager;

    const LIMIT: usize = 10 * 1024;

    struct Fixture {
        dispatcher: MessageDispatcher,
        conn: Arc<Connection>,
        rx: mpsc::Receiver<Outbound>,
        unified: Arc<RecordingUnified>,
        agent: Arc<RecordingAgent>,
    }

    async fn fixture() -> Fixture {
        let unified = Arc::new(RecordingUnified::default());
        let agent = Arc::new(RecordingAgent::default());
        let registry = ConnectionRegistry::new(5);
        let (tx, rx) = mpsc::channel(16);
        let conn = registry.add(session("u1"), tx).await;
        unified.connect(conn.id(), "u1").await.unwrap();
        Fixture {
            dispatcher: MessageDispatcher::new(unified.clone(), agent.clone(), LIMIT),
            conn,
            rx,
            unified,
            agent,
        }
    }

    fn sent(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Outbound::Text(text) = frame {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    fn code_of(text: &str) -> String {
        parse_frame(text, LIMIT).unwrap_err().code
    }

    // ─────────────────────────────────────────────────────────────────────
    // Validation pipeline
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn validation_codes_in_order() {
        assert_eq!(code_of(""), "EMPTY_MESSAGE");
        assert_eq!(code_of("   \n\t"), "EMPTY_MESSAGE");
        assert_eq!(code_of("{not json"), "JSON_PARSE_ERROR");
        assert_eq!(code_of("[1, 2]"), "INVALID_MESSAGE_TYPE");
        assert_eq!(code_of("\"ping\""), "INVALID_MESSAGE_TYPE");
        assert_eq!(code_of("42"), "INVALID_MESSAGE_TYPE");
        assert_eq!(code_of(r#"{"payload": {}}"#), "MISSING_TYPE_FIELD");
        assert_eq!(code_of(r#"{"type": 7}"#), "INVALID_TYPE_FIELD");
        assert_eq!(code_of(r#"{"type": null}"#), "INVALID_TYPE_FIELD");
        assert_eq!(code_of(r#"{"type": "  "}"#), "INVALID_TYPE_FIELD");
    }

    #[test]
    fn size_check_comes_first() {
        // Oversized and not JSON: size wins
        let big = "x".repeat(LIMIT + 1);
        assert_eq!(code_of(&big), "MESSAGE_TOO_LARGE");

        let exactly = format!(r#"{{"type":"note","payload":{{"t":"{}"}}}}"#, "a".repeat(100));
        assert!(parse_frame(&exactly, exactly.len()).is_ok());
        assert_eq!(
            parse_frame(&exactly, exactly.len() - 1).unwrap_err().code,
            "MESSAGE_TOO_LARGE"
        );
    }

    #[test]
    fn parse_error_carries_parser_detail() {
        let err = parse_frame("{\"type\": ", LIMIT).unwrap_err();
        assert!(err.error.starts_with("Invalid JSON:"));
        assert!(err.recoverable);
    }

    #[test]
    fn classifies_valid_frames() {
        assert!(matches!(
            parse_frame(r#"{"type":"ping"}"#, LIMIT).unwrap(),
            ClientMessage::Ping { .. }
        ));
        match parse_frame(r#"{"type":"chat_typing","payload":{"on":true}}"#, LIMIT).unwrap() {
            ClientMessage::Forward(msg) => {
                assert_eq!(msg.kind, "chat_typing");
                assert_eq!(msg.payload, Some(json!({"on": true})));
            }
            other => panic!("expected forward, got {other:?}"),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Local handling
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn ping_gets_exactly_one_pong() {
        let mut f = fixture().await;
        f.dispatcher
            .process_text(&f.conn, r#"{"type":"ping"}"#)
            .await
            .unwrap();

        let replies = sent(&mut f.rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["type"], "pong");
        assert!(replies[0]["payload"]["timestamp"].is_i64());
        assert!(replies[0]["payload"]["server_time"].is_string());
    }

    #[tokio::test]
    async fn pong_and_auth_get_no_reply() {
        let mut f = fixture().await;
        f.dispatcher
            .process_text(&f.conn, r#"{"type":"pong"}"#)
            .await
            .unwrap();
        f.dispatcher
            .process_text(&f.conn, r#"{"type":"auth","payload":{"token":"x"}}"#)
            .await
            .unwrap();

        assert!(sent(&mut f.rx).is_empty());
        assert!(f.unified.handled().is_empty());
    }

    #[tokio::test]
    async fn invalid_frame_sends_error_and_counts_it() {
        let mut f = fixture().await;
        let code = f.dispatcher.process_text(&f.conn, "{oops").await.unwrap_err();

        assert_eq!(code, ErrorCode::JsonParseError);
        assert_eq!(f.conn.error_count(), 1);
        let replies = sent(&mut f.rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["type"], "error");
        assert_eq!(replies[0]["payload"]["code"], "JSON_PARSE_ERROR");
        assert_eq!(replies[0]["payload"]["recoverable"], true);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Forwarding
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn other_types_go_to_the_message_manager_only() {
        let mut f = fixture().await;
        f.dispatcher
            .process_text(&f.conn, r#"{"type":"presence","payload":{"away":true}}"#)
            .await
            .unwrap();

        assert_eq!(f.unified.handled(), vec!["presence"]);
        assert!(f.agent.received().is_empty());
        assert!(sent(&mut f.rx).is_empty());
    }

    #[tokio::test]
    async fn user_and_agent_messages_also_reach_the_agent() {
        let f = fixture().await;
        let raw = r#"{"type":"user_message","payload":{"content":"hi"},"id":"m1"}"#;
        f.dispatcher.process_text(&f.conn, raw).await.unwrap();
        f.dispatcher
            .process_text(&f.conn, r#"{"type":"agent_request","payload":{"agent":"a1"}}"#)
            .await
            .unwrap();

        assert_eq!(f.unified.handled(), vec!["user_message", "agent_request"]);
        let received = f.agent.received();
        assert_eq!(received.len(), 2);
        // The raw message is forwarded untouched
        assert_eq!(received[0], serde_json::from_str::<Value>(raw).unwrap());
    }

    #[tokio::test]
    async fn manager_validation_error_is_surfaced_with_its_code() {
        let mut f = fixture().await;
        let code = f
            .dispatcher
            .process_text(&f.conn, r#"{"type":"reject_me"}"#)
            .await
            .unwrap_err();

        assert_eq!(code, ErrorCode::Custom("BAD_THING".into()));
        let replies = sent(&mut f.rx);
        assert_eq!(replies[0]["payload"]["code"], "BAD_THING");
        assert_eq!(replies[0]["payload"]["error"], "thing is bad");
        assert_eq!(replies[0]["payload"]["recoverable"], true);
        assert_eq!(
            replies[0]["payload"]["help"],
            "Check the message format and try again."
        );
    }

    #[tokio::test]
    async fn manager_failure_becomes_processing_error() {
        let mut f = fixture().await;
        let code = f
            .dispatcher
            .process_text(&f.conn, r#"{"type":"crash_me"}"#)
            .await
            .unwrap_err();

        assert_eq!(code, ErrorCode::ProcessingError);
        assert_eq!(sent(&mut f.rx)[0]["payload"]["code"], "PROCESSING_ERROR");
        assert_eq!(f.conn.error_count(), 1);
    }

    #[tokio::test]
    async fn manager_panic_is_contained() {
        let mut f = fixture().await;
        let code = f
            .dispatcher
            .process_text(&f.conn, r#"{"type":"panic_me"}"#)
            .await
            .unwrap_err();
        assert_eq!(code, ErrorCode::ProcessingError);
        assert_eq!(sent(&mut f.rx)[0]["payload"]["code"], "PROCESSING_ERROR");

        // Still usable afterwards
        f.dispatcher
            .process_text(&f.conn, r#"{"type":"ping"}"#)
            .await
            .unwrap();
        assert_eq!(sent(&mut f.rx)[0]["type"], "pong");
    }

    #[tokio::test]
    async fn agent_failure_becomes_processing_error() {
        let mut f = fixture().await;
        *f.agent.fail.lock() = true;
        let code = f
            .dispatcher
            .process_text(&f.conn, r#"{"type":"user_message","payload":{"content":"hi"}}"#)
            .await
            .unwrap_err();

        assert_eq!(code, ErrorCode::ProcessingError);
        assert_eq!(sent(&mut f.rx)[0]["payload"]["code"], "PROCESSING_ERROR");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Binary frames
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn utf8_binary_is_treated_as_text() {
        let mut f = fixture().await;
        f.dispatcher
            .process_binary(&f.conn, br#"{"type":"ping"}"#.to_vec())
            .await
            .unwrap();
        assert_eq!(sent(&mut f.rx)[0]["type"], "pong");
    }

    #[tokio::test]
    async fn non_utf8_binary_is_rejected() {
        let mut f = fixture().await;
        let code = f
            .dispatcher
            .process_binary(&f.conn, vec![0xff, 0xfe, 0x00])
            .await
            .unwrap_err();
        assert_eq!(code, ErrorCode::InvalidMessageType);
        assert_eq!(sent(&mut f.rx)[0]["payload"]["code"], "INVALID_MESSAGE_TYPE");
    }
}
