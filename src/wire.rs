//! The on-the-wire record shape shared by requests, success responses, and
//! error responses.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SerializedError;

/// Suffix appended to a message type's name to form a success response's type.
pub const RESULT_SUFFIX: &str = "Result";
/// Suffix appended to a message type's name to form an error response's type.
pub const ERROR_SUFFIX: &str = "Error";

/// A single wire record: `{tx, type, payload}`.
///
/// For a request, `kind` is the user-chosen message-type name. For a
/// success response, `kind` is `<type>Result`. For an error response,
/// `kind` is `<type>Error` and `payload` is a [`SerializedError`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub tx: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

impl Frame {
    /// Build a request frame for message type `kind`.
    pub fn request(tx: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            tx: tx.into(),
            kind: kind.into(),
            payload,
        }
    }

    /// Build a success-response frame answering a request of type `request_kind`.
    pub fn result(tx: impl Into<String>, request_kind: &str, payload: Value) -> Self {
        Self {
            tx: tx.into(),
            kind: format!("{request_kind}{RESULT_SUFFIX}"),
            payload,
        }
    }

    /// Build an error-response frame answering a request of type `request_kind`.
    pub fn error(tx: impl Into<String>, request_kind: &str, err: SerializedError) -> Self {
        Self {
            tx: tx.into(),
            kind: format!("{request_kind}{ERROR_SUFFIX}"),
            payload: serde_json::to_value(err).unwrap_or(Value::Null),
        }
    }

    /// True if `kind` carries the `Result` suffix.
    pub fn is_result(&self) -> bool {
        self.kind.ends_with(RESULT_SUFFIX)
    }

    /// True if `kind` carries the `Error` suffix.
    pub fn is_error(&self) -> bool {
        self.kind.ends_with(ERROR_SUFFIX)
    }

    /// The bare message-type name this frame answers, stripping the
    /// `Result`/`Error` suffix if present. Returns `None` if the frame is a
    /// request (no suffix to strip, the kind is already bare).
    pub fn base_type(&self) -> &str {
        if let Some(base) = self.kind.strip_suffix(RESULT_SUFFIX) {
            base
        } else if let Some(base) = self.kind.strip_suffix(ERROR_SUFFIX) {
            base
        } else {
            &self.kind
        }
    }

    /// Deserialize this frame's payload as a [`SerializedError`]. Only
    /// meaningful when [`Frame::is_error`] is true.
    pub fn error_payload(&self) -> Result<SerializedError, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn suffixes_round_trip() {
        let f = Frame::result("tx-1", "echo", serde_json::json!("hello"));
        assert_eq!(f.kind, "echoResult");
        assert!(f.is_result());
        assert_eq!(f.base_type(), "echo");

        let e = Frame::error("tx-1", "divide", SerializedError::new("Error", "bad"));
        assert_eq!(e.kind, "divideError");
        assert!(e.is_error());
        assert_eq!(e.base_type(), "divide");
    }
}
