//! In-memory port transport, used by the thread driver.
//!
//! A pair of bidirectional message ports is established at worker creation;
//! each side reads and writes byte chunks over an in-process channel. The
//! [`Framer`](crate::framer::Framer) still runs on top so payloads pass
//! through exactly as they would over the socket transport.

use thiserror::Error;
use tokio::sync::mpsc::{Receiver, Sender};

use super::{TransportRx, TransportTx};

#[derive(Debug, Error)]
pub enum PortError {
    #[error("the peer end of this port has been dropped")]
    Closed,
}

pub struct PortTx {
    sender: Sender<Vec<u8>>,
}

impl TransportTx for PortTx {
    type Error = PortError;

    async fn send(&mut self, data: Vec<u8>) -> Result<(), PortError> {
        self.sender.send(data).await.map_err(|_| PortError::Closed)
    }
}

pub struct PortRx {
    receiver: Receiver<Vec<u8>>,
}

impl TransportRx for PortRx {
    type Error = PortError;

    async fn receive(&mut self) -> Result<Vec<u8>, PortError> {
        self.receiver.recv().await.ok_or(PortError::Closed)
    }
}

/// Depth of the underlying channel in each direction. Generous enough that
/// a burst of concurrent sends does not block on a slow reader, matching
/// a slow reader's outgoing depth.
pub const DEFAULT_DEPTH: usize = 64;

/// One endpoint of an in-memory port pair.
pub struct PortEnd {
    pub tx: PortTx,
    pub rx: PortRx,
}

/// Create a bidirectional port pair: `(host_end, worker_end)`. Bytes the
/// host writes arrive at the worker's receive half and vice versa.
pub fn pair() -> (PortEnd, PortEnd) {
    pair_with_depth(DEFAULT_DEPTH)
}

pub fn pair_with_depth(depth: usize) -> (PortEnd, PortEnd) {
    let (host_to_worker_tx, host_to_worker_rx) = tokio::sync::mpsc::channel(depth);
    let (worker_to_host_tx, worker_to_host_rx) = tokio::sync::mpsc::channel(depth);

    let host_end = PortEnd {
        tx: PortTx { sender: host_to_worker_tx },
        rx: PortRx { receiver: worker_to_host_rx },
    };
    let worker_end = PortEnd {
        tx: PortTx { sender: worker_to_host_tx },
        rx: PortRx { receiver: host_to_worker_rx },
    };
    (host_end, worker_end)
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn bytes_written_on_one_end_arrive_on_the_other() {
        let (mut host, mut worker) = pair();
        host.tx.send(vec![1, 2, 3]).await.unwrap();
        let got = worker.rx.receive().await.unwrap();
        assert_eq!(got, vec![1, 2, 3]);

        worker.tx.send(vec![4, 5]).await.unwrap();
        let got = host.rx.receive().await.unwrap();
        assert_eq!(got, vec![4, 5]);
    }

    #[tokio::test]
    async fn closed_peer_is_reported() {
        let (host, worker) = pair();
        drop(worker);
        let mut host = host;
        let err = host.tx.send(vec![1]).await.unwrap_err();
        assert!(matches!(err, PortError::Closed));
    }
}
