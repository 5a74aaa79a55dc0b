//! Client-facing error codes and the payload of the `error` envelope.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Error codes reported to clients inside an `error` envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    // Syntactic validation, in pipeline order
    MessageTooLarge,
    EmptyMessage,
    JsonParseError,
    InvalidMessageType,
    MissingTypeField,
    InvalidTypeField,

    // Session
    MessageTimeout,
    ProcessingError,
    ValidationError,
    ErrorLimitExceeded,

    // Code supplied by a downstream validator
    Custom(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::MessageTooLarge => "MESSAGE_TOO_LARGE",
            Self::EmptyMessage => "EMPTY_MESSAGE",
            Self::JsonParseError => "JSON_PARSE_ERROR",
            Self::InvalidMessageType => "INVALID_MESSAGE_TYPE",
            Self::MissingTypeField => "MISSING_TYPE_FIELD",
            Self::InvalidTypeField => "INVALID_TYPE_FIELD",
            Self::MessageTimeout => "MESSAGE_TIMEOUT",
            Self::ProcessingError => "PROCESSING_ERROR",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::ErrorLimitExceeded => "ERROR_LIMIT_EXCEEDED",
            Self::Custom(code) => code,
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "MESSAGE_TOO_LARGE" => Self::MessageTooLarge,
            "EMPTY_MESSAGE" => Self::EmptyMessage,
            "JSON_PARSE_ERROR" => Self::JsonParseError,
            "INVALID_MESSAGE_TYPE" => Self::InvalidMessageType,
            "MISSING_TYPE_FIELD" => Self::MissingTypeField,
            "INVALID_TYPE_FIELD" => Self::InvalidTypeField,
            "MESSAGE_TIMEOUT" => Self::MessageTimeout,
            "PROCESSING_ERROR" => Self::ProcessingError,
            "VALIDATION_ERROR" => Self::ValidationError,
            "ERROR_LIMIT_EXCEEDED" => Self::ErrorLimitExceeded,
            other => Self::Custom(other.to_string()),
        }
    }

    /// Fixed human-readable hint shown alongside the error.
    pub fn help(&self) -> &'static str {
        match self {
            Self::MessageTooLarge => {
                "Reduce the message size below the max_message_size advertised in the connection limits."
            }
            Self::EmptyMessage => "Send a non-empty JSON object, for example {\"type\": \"ping\"}.",
            Self::JsonParseError => "Messages must be valid JSON. Check quotes, commas and brackets.",
            Self::InvalidMessageType => "Messages must be JSON objects, not arrays, strings or numbers.",
            Self::MissingTypeField => {
                "Every message needs a \"type\" field, for example {\"type\": \"ping\"}."
            }
            Self::InvalidTypeField => "The \"type\" field must be a non-empty string.",
            Self::MessageTimeout => {
                "No message was received recently. Send a ping to keep the connection active."
            }
            Self::ProcessingError => {
                "The server could not process this message. Retry, and contact support if it keeps failing."
            }
            Self::ValidationError => {
                "The message payload failed validation. Check the required fields for this message type."
            }
            Self::ErrorLimitExceeded => {
                "Too many consecutive errors. Fix the messages being sent and reconnect."
            }
            Self::Custom(_) => "Check the message format and try again.",
        }
    }

    /// Only the error-limit case ends the session.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::ErrorLimitExceeded)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an outbound `error` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
    pub code: String,
    pub timestamp: String,
    pub recoverable: bool,
    pub help: String,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.as_str().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            recoverable: code.is_recoverable(),
            help: code.help().to_string(),
        }
    }

    pub fn message_too_large(size: usize, limit: usize) -> Self {
        Self::new(
            ErrorCode::MessageTooLarge,
            format!("Message of {size} bytes exceeds the {limit} byte limit"),
        )
    }

    pub fn empty_message() -> Self {
        Self::new(ErrorCode::EmptyMessage, "Empty message received")
    }

    pub fn json_parse(detail: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::JsonParseError, format!("Invalid JSON: {detail}"))
    }

    pub fn invalid_message_type() -> Self {
        Self::new(ErrorCode::InvalidMessageType, "Message must be a JSON object")
    }

    pub fn missing_type_field() -> Self {
        Self::new(ErrorCode::MissingTypeField, "Message is missing the 'type' field")
    }

    pub fn invalid_type_field() -> Self {
        Self::new(ErrorCode::InvalidTypeField, "Message 'type' must be a non-empty string")
    }

    pub fn message_timeout(secs: u64) -> Self {
        Self::new(
            ErrorCode::MessageTimeout,
            format!("No message received in {secs} seconds"),
        )
    }

    pub fn processing_error() -> Self {
        Self::new(ErrorCode::ProcessingError, "Failed to process message")
    }

    pub fn validation(code: Option<&str>, message: impl Into<String>) -> Self {
        let code = code.map_or(ErrorCode::ValidationError, ErrorCode::from_code);
        Self::new(code, message)
    }

    pub fn error_limit_exceeded(limit: u32) -> Self {
        Self::new(
            ErrorCode::ErrorLimitExceeded,
            format!("Too many consecutive errors ({limit}), closing connection"),
        )
    }

    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::from_code(&self.code)
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.error)
    }
}
