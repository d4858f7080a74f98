//! Stateful byte accumulator turning a byte stream into discrete frames.
//!
//! Uses a growable buffer and an arbitrary terminator sequence supplied by
//! the [`Serializer`](crate::serializer::Serializer) in use, rather than a
//! fixed-size buffer and a single zero-byte terminator.

use std::sync::Arc;

use crate::serializer::Serializer;
use crate::wire::Frame;

/// The result of decoding one extracted frame.
#[derive(Debug)]
pub enum FeedOutcome {
    /// The frame decoded successfully.
    Frame(Frame),
    /// A terminator was found but the bytes preceding it failed to decode.
    /// The offending bytes are discarded; framing continues.
    DecodeError(crate::serializer::SerializerError),
}

/// Accumulates inbound bytes and extracts terminator-delimited frames.
///
/// On each inbound chunk, `feed` appends to an internal buffer, then
/// repeatedly extracts the longest prefix ending in the serializer's
/// terminator, decodes each such prefix, and retains the unterminated
/// remainder for the next call. A terminator spanning two `feed` calls
/// (a chunk boundary falling mid-terminator) is handled transparently
/// because the buffer persists across calls.
pub struct Framer {
    serializer: Arc<dyn Serializer>,
    buf: Vec<u8>,
    max_frame_len: usize,
}

/// Default cap on a single buffered (not yet terminated) frame, guarding
/// against an unbounded buffer growth if a terminator never arrives.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

impl Framer {
    pub fn new(serializer: Arc<dyn Serializer>) -> Self {
        Self {
            serializer,
            buf: Vec::new(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(serializer: Arc<dyn Serializer>, max_frame_len: usize) -> Self {
        Self {
            serializer,
            buf: Vec::new(),
            max_frame_len,
        }
    }

    /// Encode `frame` and append the serializer's terminator, ready to
    /// write to the transport.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, crate::serializer::SerializerError> {
        let mut bytes = self.serializer.encode(frame)?;
        bytes.extend_from_slice(self.serializer.terminator());
        Ok(bytes)
    }

    /// Feed a chunk of inbound bytes, returning every frame (or decode
    /// error) extracted by this call, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<FeedOutcome> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        let term = self.serializer.terminator();

        loop {
            let Some(pos) = find_subslice(&self.buf, term) else {
                if self.buf.len() > self.max_frame_len {
                    tracing::warn!(
                        buffered = self.buf.len(),
                        "framer buffer exceeded max frame length with no terminator, discarding"
                    );
                    self.buf.clear();
                }
                break;
            };

            let rest = self.buf.split_off(pos + term.len());
            let mut payload = std::mem::replace(&mut self.buf, rest);
            payload.truncate(payload.len() - term.len());

            match self.serializer.decode(&payload) {
                Ok(frame) => out.push(FeedOutcome::Frame(frame)),
                Err(e) => {
                    tracing::warn!(error = %e, "discarding frame that failed to decode");
                    out.push(FeedOutcome::DecodeError(e));
                }
            }
        }

        out
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::serializer::JsonSerializer;
    use serde_json::json;

    fn framer() -> Framer {
        Framer::new(Arc::new(JsonSerializer))
    }

    #[test]
    fn single_frame_in_one_chunk() {
        let mut f = framer();
        let frame = Frame::request("tx-1", "echo", json!("hi"));
        let bytes = f.encode(&frame).unwrap();
        let out = f.feed(&bytes);
        assert_eq!(out.len(), 1);
        match &out[0] {
            FeedOutcome::Frame(got) => assert_eq!(got.tx, "tx-1"),
            _ => panic!("expected a frame"),
        }
    }

    #[test]
    fn frame_split_across_chunks_including_mid_terminator() {
        let mut f = framer();
        let frame = Frame::request("tx-1", "echo", json!("hi"));
        let bytes = f.encode(&frame).unwrap();
        assert_eq!(f.feed(&bytes[..bytes.len() - 1]).len(), 0);
        let out = f.feed(&bytes[bytes.len() - 1..]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn multiple_frames_coalesced_into_one_chunk() {
        let mut f = framer();
        let a = f.encode(&Frame::request("tx-1", "echo", json!(1))).unwrap();
        let b = f.encode(&Frame::request("tx-2", "echo", json!(2))).unwrap();
        let mut combined = a;
        combined.extend_from_slice(&b);
        let out = f.feed(&combined);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn malformed_frame_is_discarded_and_framing_continues() {
        let mut f = framer();
        let mut bad = b"{not json".to_vec();
        bad.push(b'\n');
        let good = f.encode(&Frame::request("tx-2", "echo", json!(2))).unwrap();
        bad.extend_from_slice(&good);
        let out = f.feed(&bad);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], FeedOutcome::DecodeError(_)));
        assert!(matches!(out[1], FeedOutcome::Frame(_)));
    }
}
