//! Serializer abstraction.
//!
//! A serializer converts a [`Frame`] to/from bytes and names a terminator: a
//! non-empty byte sequence that never occurs inside any encoding it
//! produces. The [`Framer`](crate::framer::Framer) is built against this
//! trait so an alternative serializer (e.g. length-prefixed binary) can be
//! substituted as long as host and worker agree.

use thiserror::Error;

use crate::wire::Frame;

/// Failures from encoding or decoding a frame.
#[derive(Debug, Error)]
pub enum SerializerError {
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode frame: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("encoded frame contains an embedded terminator sequence")]
    EmbeddedTerminator,
}

/// Converts structured [`Frame`] values to/from bytes for one connection.
///
/// Implementations must guarantee their terminator never appears inside an
/// encoded frame; [`Serializer::class_name`] is advertised in startup data
/// so a worker loading a different serializer can reject startup with
/// [`crate::error::ClientError::SerializerMismatch`].
pub trait Serializer: Send + Sync + 'static {
    /// A stable name identifying this serializer's wire format. Sent as
    /// part of startup data; host and worker must agree.
    fn class_name(&self) -> &'static str;

    /// The byte sequence that marks the end of a frame on the wire.
    fn terminator(&self) -> &'static [u8];

    /// Encode `frame`, appending nothing — the terminator is added by the
    /// caller (typically the [`Framer`](crate::framer::Framer)).
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, SerializerError>;

    /// Decode a single terminator-stripped frame payload.
    fn decode(&self, bytes: &[u8]) -> Result<Frame, SerializerError>;
}

/// The default serializer: textual JSON with a line-feed terminator.
///
/// JSON escapes embedded newlines within string values, so the "terminator
/// never appears inside a payload" invariant holds by construction; we still
/// assert it defensively in [`Serializer::encode`] rather than relying on
/// that argument alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn class_name(&self) -> &'static str {
        "json"
    }

    fn terminator(&self) -> &'static [u8] {
        b"\n"
    }

    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, SerializerError> {
        let bytes = serde_json::to_vec(frame).map_err(SerializerError::Encode)?;
        if bytes.windows(self.terminator().len()).any(|w| w == self.terminator()) {
            return Err(SerializerError::EmbeddedTerminator);
        }
        Ok(bytes)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Frame, SerializerError> {
        serde_json::from_slice(bytes).map_err(SerializerError::Decode)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips() {
        let ser = JsonSerializer;
        let frame = Frame::request("tx-1", "echo", json!("hello"));
        let bytes = ser.encode(&frame).unwrap();
        let back = ser.decode(&bytes).unwrap();
        assert_eq!(back.tx, frame.tx);
        assert_eq!(back.kind, frame.kind);
        assert_eq!(back.payload, frame.payload);
    }

    #[test]
    fn embedded_newline_in_payload_is_escaped_not_embedded() {
        let ser = JsonSerializer;
        let frame = Frame::request("tx-1", "echo", json!("line one\nline two"));
        let bytes = ser.encode(&frame).unwrap();
        assert!(!bytes.windows(1).any(|w| w == b"\n"));
    }
}
