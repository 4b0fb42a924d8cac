//! Debug channel messages.
//!
//! One JSON message set shared by both sides of the Debug Hub: telemetry
//! published by the injected iframe instrumentation, and commands issued by
//! UI observers. Unknown `type` values are surfaced to the caller so the
//! transport can log and drop them instead of silently miscasting.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DebugMessage {
    // Iframe → hub: page lifecycle
    PageLoad {
        url: String,
    },
    UrlChanged {
        url: String,
    },
    NavigationState {
        can_go_back: bool,
        can_go_forward: bool,
    },

    // Iframe → hub: injected instrumentation telemetry
    Console {
        level: String,
        message: String,
    },
    PageError {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
    UnhandledRejection {
        message: String,
    },
    Fetch {
        method: String,
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    Xhr {
        method: String,
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },

    // Externally triggered: delivered to the designated UI observer only
    OpenUrl {
        url: String,
    },

    // UI observer → iframe clients
    Navigate {
        url: String,
    },
    Reload,
    QueryDom {
        request_id: String,
        selector: String,
    },
    DomResult {
        request_id: String,
        html: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DebugParseError {
    #[error("unsupported debug message type {0:?}")]
    UnknownType(String),
    #[error("malformed debug message: {0}")]
    Malformed(String),
}

/// Parse a debug channel payload. Distinguishes an unknown-but-well-formed
/// `type` (dropped by the transport with a log line) from garbage.
pub fn parse(text: &str) -> Result<DebugMessage, DebugParseError> {
    match serde_json::from_str::<DebugMessage>(text) {
        Ok(msg) => Ok(msg),
        Err(err) => {
            let type_name = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(String::from));
            match type_name {
                Some(name) => Err(DebugParseError::UnknownType(name)),
                None => Err(DebugParseError::Malformed(err.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_roundtrip() {
        let msg = DebugMessage::Console {
            level: "warn".into(),
            message: "deprecated API".into(),
        };
        let json = serde_json::to_string(&msg).expect("serialize");
        assert!(json.contains("\"type\":\"console\""));
        assert_eq!(parse(&json).unwrap(), msg);
    }

    #[test]
    fn unknown_type_is_reported_not_miscast() {
        let err = parse(r#"{"type":"telepathy","payload":1}"#).unwrap_err();
        assert_eq!(err, DebugParseError::UnknownType("telepathy".into()));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            parse("not json"),
            Err(DebugParseError::Malformed(_))
        ));
        // Known type with a missing required field: well-formed JSON but not
        // a valid message, and there is no better variant to report.
        assert!(matches!(
            parse(r#"{"type":"navigate"}"#),
            Err(DebugParseError::UnknownType(_))
        ));
    }
}
