//! Transport abstraction.
//!
//! Two interchangeable transports share this trait pair: the stream-socket
//! transport ([`socket`]) and the in-memory port transport ([`port`]). Both
//! move raw, already-framed bytes; the [`Framer`](crate::framer::Framer)
//! sits on top so the serializer contract is uniform across either
//! backing.

pub mod port;
pub mod socket;

use std::future::Future;

/// Transmit half of a transport.
pub trait TransportTx: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Write one already-terminated frame's worth of bytes.
    fn send(&mut self, data: Vec<u8>) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Receive half of a transport.
pub trait TransportRx: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Receive the next available chunk of bytes (not necessarily a whole
    /// frame — the [`Framer`](crate::framer::Framer) handles reassembly).
    fn receive(&mut self) -> impl Future<Output = Result<Vec<u8>, Self::Error>> + Send;
}

/// Events a transport reports to the layers above it.
#[derive(Debug)]
pub enum TransportEvent {
    FrameReceived(Vec<u8>),
    RemoteClosed,
    LocalError(std::io::Error),
}
