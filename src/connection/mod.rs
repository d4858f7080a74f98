//! Connection: transport + framer + serializer composed into a reliable
//! send/receive channel with bounded connect retry, incoming-frame
//! dispatch, and lifecycle events.

mod retry;

pub use retry::{ConnectRetryPolicy, FixedBackoff, RetrySchedule};

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::error::ClientError;
use crate::framer::{FeedOutcome, Framer};
use crate::middleware::{Direction, MiddlewareChain};
use crate::serializer::Serializer;
use crate::transport::{TransportRx, TransportTx};
use crate::wire::Frame;

/// One of `Connecting`, `Open`, `Closing`, `Closed`. Transitions are
/// monotonic except that a connection may be re-created after a successful
/// driver respawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Type-erased transmit half, so [`Connection`] doesn't need to be generic
/// over the concrete transport.
#[async_trait]
pub trait DynTx: Send {
    async fn send(&mut self, data: Vec<u8>) -> io::Result<()>;
}

/// Type-erased receive half.
#[async_trait]
pub trait DynRx: Send {
    async fn receive(&mut self) -> io::Result<Vec<u8>>;
}

struct TxAdapter<T>(T);

#[async_trait]
impl<T: TransportTx> DynTx for TxAdapter<T> {
    async fn send(&mut self, data: Vec<u8>) -> io::Result<()> {
        self.0
            .send(data)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}

struct RxAdapter<T>(T);

#[async_trait]
impl<T: TransportRx> DynRx for RxAdapter<T> {
    async fn receive(&mut self) -> io::Result<Vec<u8>> {
        self.0
            .receive()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}

/// Box up a concrete [`TransportTx`]/[`TransportRx`] pair for [`Connection::new`].
pub fn erase<TX, RX>(tx: TX, rx: RX) -> (Box<dyn DynTx>, Box<dyn DynRx>)
where
    TX: TransportTx,
    RX: TransportRx,
{
    (Box::new(TxAdapter(tx)), Box::new(RxAdapter(rx)))
}

type MessageHandler = Box<dyn Fn(Frame) + Send + Sync>;
type ErrorHandler = Box<dyn Fn(&str) + Send + Sync>;
type CloseHandler = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Handlers {
    on_message: Vec<MessageHandler>,
    on_error: Vec<ErrorHandler>,
    on_close: Vec<CloseHandler>,
}

/// A live, bidirectional connection to one peer.
pub struct Connection {
    state: Arc<AtomicU8>,
    tx: Arc<Mutex<Box<dyn DynTx>>>,
    serializer: Arc<dyn Serializer>,
    middleware: Arc<MiddlewareChain>,
    handlers: Arc<Mutex<Handlers>>,
    closed: Arc<Notify>,
    reader: Option<JoinHandle<()>>,
}

impl Connection {
    /// Wrap an already-established transport pair as an `Open` connection
    /// and start the read loop that dispatches incoming frames.
    pub fn new(tx: Box<dyn DynTx>, rx: Box<dyn DynRx>, serializer: Arc<dyn Serializer>) -> Self {
        Self::with_middleware(tx, rx, serializer, Arc::new(MiddlewareChain::new()))
    }

    pub fn with_middleware(
        tx: Box<dyn DynTx>,
        mut rx: Box<dyn DynRx>,
        serializer: Arc<dyn Serializer>,
        middleware: Arc<MiddlewareChain>,
    ) -> Self {
        let state = Arc::new(AtomicU8::new(ConnectionState::Open as u8));
        let handlers: Arc<Mutex<Handlers>> = Arc::new(Mutex::new(Handlers::default()));
        let closed = Arc::new(Notify::new());

        let reader_state = state.clone();
        let reader_handlers = handlers.clone();
        let reader_closed = closed.clone();
        let reader_mw = middleware.clone();
        let reader_ser = serializer.clone();

        let reader = tokio::spawn(async move {
            let mut framer = Framer::new(reader_ser);
            loop {
                match rx.receive().await {
                    Ok(chunk) => {
                        for outcome in framer.feed(&chunk) {
                            match outcome {
                                FeedOutcome::Frame(frame) => {
                                    let frame = reader_mw.run(Direction::Incoming, frame);
                                    let guard = reader_handlers.lock().await;
                                    for h in &guard.on_message {
                                        h(frame.clone());
                                    }
                                }
                                FeedOutcome::DecodeError(e) => {
                                    tracing::warn!(error = %e, "dropping malformed frame");
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "connection read loop ending");
                        reader_state.store(ConnectionState::Closed as u8, Ordering::SeqCst);
                        let guard = reader_handlers.lock().await;
                        for h in &guard.on_error {
                            h(&e.to_string());
                        }
                        for h in &guard.on_close {
                            h();
                        }
                        drop(guard);
                        reader_closed.notify_waiters();
                        return;
                    }
                }
            }
        });

        Self {
            state,
            tx: Arc::new(Mutex::new(tx)),
            serializer,
            middleware,
            handlers,
            closed,
            reader: Some(reader),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Write one frame. Fails with [`ClientError::NotConnected`] if the
    /// state is not `Open`.
    pub async fn send(&self, frame: Frame) -> Result<(), ClientError> {
        if self.state() != ConnectionState::Open {
            return Err(ClientError::NotConnected);
        }
        let frame = self.middleware.run(Direction::Outgoing, frame);
        let framer = Framer::new(self.serializer.clone());
        let bytes = framer.encode(&frame)?;
        let mut guard = self.tx.lock().await;
        guard
            .send(bytes)
            .await
            .map_err(ClientError::Io)
    }

    pub async fn on_message<F>(&self, handler: F)
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        self.handlers.lock().await.on_message.push(Box::new(handler));
    }

    pub async fn on_error<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.handlers.lock().await.on_error.push(Box::new(handler));
    }

    pub async fn on_close<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.handlers.lock().await.on_close.push(Box::new(handler));
    }

    /// Attempt graceful close (wait for the remote to close, up to 5s),
    /// then force-close.
    pub async fn close(&mut self) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.state.store(ConnectionState::Closing as u8, Ordering::SeqCst);
        let wait = self.closed.notified();
        let _ = tokio::time::timeout(Duration::from_secs(5), wait).await;
        self.state.store(ConnectionState::Closed as u8, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Retry a fallible connect operation against the given [`ConnectRetryPolicy`]
/// `attempt` is retried up to `policy.max_attempts` times, with
/// each attempt bounded by `policy.attempt_deadline` and delays drawn from
/// `policy.schedule`.
pub async fn connect_with_retry<F, Fut, T, E>(
    policy: &ConnectRetryPolicy,
    mut attempt: F,
) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut last_err: Option<String> = None;
    let mut last_was_timeout = false;
    for n in 0..policy.max_attempts {
        let fut = attempt();
        match tokio::time::timeout(policy.attempt_deadline, fut).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                tracing::warn!(attempt = n + 1, error = %e, "connect attempt failed");
                last_err = Some(e.to_string());
                last_was_timeout = false;
            }
            Err(_elapsed) => {
                tracing::warn!(attempt = n + 1, "connect attempt timed out");
                last_err = Some("attempt deadline elapsed".to_string());
                last_was_timeout = true;
            }
        }
        if n + 1 < policy.max_attempts {
            tokio::time::sleep(policy.schedule.delay(n + 1)).await;
        }
    }
    if last_was_timeout {
        Err(ClientError::ConnectTimeout)
    } else {
        Err(ClientError::ConnectRefused(
            last_err.unwrap_or_else(|| "connect budget exhausted".to_string()),
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::serializer::JsonSerializer;
    use crate::transport::port;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn send_and_receive_round_trip() {
        let (host_end, worker_end) = port::pair();
        let (htx, hrx) = erase(host_end.tx, host_end.rx);
        let (wtx, wrx) = erase(worker_end.tx, worker_end.rx);
        let host_conn = Connection::new(htx, hrx, Arc::new(JsonSerializer));
        let worker_conn = Connection::new(wtx, wrx, Arc::new(JsonSerializer));

        let received = Arc::new(AtomicUsize::new(0));
        let received2 = received.clone();
        worker_conn
            .on_message(move |_frame| {
                received2.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        host_conn
            .send(Frame::request("tx-1", "echo", json!("hi")))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_fails_when_not_open() {
        let (host_end, worker_end) = port::pair();
        let (htx, hrx) = erase(host_end.tx, host_end.rx);
        let mut conn = Connection::new(htx, hrx, Arc::new(JsonSerializer));
        drop(worker_end);
        conn.close().await;
        let err = conn
            .send(Frame::request("tx-1", "echo", json!("hi")))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }
}
