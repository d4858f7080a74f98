//! Worker-side request dispatcher.
//!
//! Accepts a single host connection, looks up a handler per message type,
//! and runs handlers concurrently: one task per in-flight request, so a
//! slow handler never blocks others. Response frames are serialized back
//! through a single mutex-guarded writer so concurrent tasks can't
//! interleave bytes on the wire.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::connection::{erase, DynRx, DynTx};
use crate::error::SerializedError;
use crate::framer::{FeedOutcome, Framer};
use crate::serializer::Serializer;
use crate::startup::StartupData;
use crate::transport::port::PortEnd;
use crate::transport::socket::SocketListener;
use crate::transport::{TransportRx, TransportTx};
use crate::wire::Frame;

/// `Accepting -> Serving -> Stopping -> Stopped`. The `Accepting ->
/// Stopping` edge is taken when no host connects before the server-connect
/// deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Accepting,
    Serving,
    Stopping,
    Stopped,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("no host connected within the server-connect deadline")]
    AcceptTimeout,
    #[error("accept failed: {0}")]
    AcceptFailed(String),
    #[error("transport error: {0}")]
    Transport(String),
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, SerializedError>> + Send>>;
type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

struct HandlerEntry {
    handler: Handler,
    /// `false` for a one-way message type: its return value is discarded
    /// and no response frame is ever written.
    has_result: bool,
}

pub struct ServerConfig {
    pub server_connect_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Dispatches requests arriving on one connection to registered handlers.
pub struct WorkerServer {
    tx: Arc<Mutex<Box<dyn DynTx>>>,
    rx: Box<dyn DynRx>,
    serializer: Arc<dyn Serializer>,
    handlers: HashMap<String, HandlerEntry>,
    state: ServerState,
}

impl WorkerServer {
    /// Build a server already connected over an in-memory port (thread
    /// driver worker side).
    pub fn new(port: PortEnd, serializer: Arc<dyn Serializer>, _config: ServerConfig) -> Self {
        let (tx, rx) = erase(port.tx, port.rx);
        Self {
            tx: Arc::new(Mutex::new(tx)),
            rx,
            serializer,
            handlers: HashMap::new(),
            state: ServerState::Serving,
        }
    }

    /// Build a server from an already-accepted transport pair (process
    /// driver worker side, after [`accept_with_deadline`]).
    pub fn from_transport<TX, RX>(tx: TX, rx: RX, serializer: Arc<dyn Serializer>) -> Self
    where
        TX: TransportTx,
        RX: TransportRx,
    {
        let (tx, rx) = erase(tx, rx);
        Self {
            tx: Arc::new(Mutex::new(tx)),
            rx,
            serializer,
            handlers: HashMap::new(),
            state: ServerState::Serving,
        }
    }

    /// Register a handler for a message type with a declared result shape:
    /// its return value is sent back as a `Result` frame.
    pub fn register<F, Fut>(&mut self, kind: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |payload| {
            let fut = handler(payload);
            Box::pin(async move { Ok(fut.await) })
        });
        self.handlers
            .insert(kind.into(), HandlerEntry { handler, has_result: true });
    }

    /// Register a fallible handler: `Err` is serialized and sent back as an
    /// `Error` frame.
    pub fn register_fallible<F, Fut>(&mut self, kind: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, SerializedError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |payload| Box::pin(handler(payload)));
        self.handlers
            .insert(kind.into(), HandlerEntry { handler, has_result: true });
    }

    /// Register a handler for a one-way message type: its return value (if
    /// any) is discarded and no response frame is sent.
    pub fn register_one_way<F, Fut>(&mut self, kind: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |payload| {
            let fut = handler(payload);
            Box::pin(async move {
                fut.await;
                Ok(Value::Null)
            })
        });
        self.handlers
            .insert(kind.into(), HandlerEntry { handler, has_result: false });
    }

    /// Run the dispatch loop until the remote closes or a transport error
    /// occurs.
    pub async fn run(&mut self) -> Result<(), ServerError> {
        self.state = ServerState::Serving;
        let mut framer = Framer::new(self.serializer.clone());
        loop {
            let chunk = self
                .rx
                .receive()
                .await
                .map_err(|e| ServerError::Transport(e.to_string()))?;

            for outcome in framer.feed(&chunk) {
                match outcome {
                    FeedOutcome::Frame(frame) => self.dispatch(frame),
                    FeedOutcome::DecodeError(e) => {
                        tracing::warn!(error = %e, "worker discarding malformed frame");
                    }
                }
            }
        }
    }

    fn dispatch(&self, frame: Frame) {
        let kind = frame.kind.clone();
        let tx_id = frame.tx.clone();
        let writer = self.tx.clone();
        let serializer = self.serializer.clone();

        let Some(entry) = self.handlers.get(&kind) else {
            tracing::warn!(kind = %kind, "no handler registered for message type");
            let err = SerializedError::new(
                "UnknownMessageType",
                format!("no handler for message type {kind}"),
            );
            let response = Frame::error(tx_id, &kind, err);
            tokio::spawn(write_frame(writer, serializer, response));
            return;
        };

        let handler = entry.handler.clone();
        let has_result = entry.has_result;
        let payload = frame.payload;

        tokio::spawn(async move {
            let outcome = handler(payload).await;
            let response = match outcome {
                Ok(value) => {
                    if !has_result {
                        tracing::trace!(kind = %kind, "discarding result of one-way message");
                        return;
                    }
                    Frame::result(tx_id, &kind, value)
                }
                Err(err) => Frame::error(tx_id, &kind, err),
            };
            write_frame(writer, serializer, response).await;
        });
    }

    pub fn state(&self) -> ServerState {
        self.state
    }
}

async fn write_frame(writer: Arc<Mutex<Box<dyn DynTx>>>, serializer: Arc<dyn Serializer>, frame: Frame) {
    let framer = Framer::new(serializer);
    let bytes = match framer.encode(&frame) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode response frame");
            return;
        }
    };
    let mut guard = writer.lock().await;
    if let Err(e) = guard.send(bytes).await {
        tracing::error!(error = %e, "failed to write response frame");
    }
}

/// Accept a single connection on `listener`, bounded by `deadline`. Returns
/// [`ServerError::AcceptTimeout`] if no host connects in time.
pub async fn accept_with_deadline(
    listener: &SocketListener,
    deadline: Duration,
) -> Result<(crate::transport::socket::SocketTx, crate::transport::socket::SocketRx), ServerError>
{
    match tokio::time::timeout(deadline, listener.accept()).await {
        Ok(Ok(pair)) => Ok(pair),
        Ok(Err(e)) => Err(ServerError::AcceptFailed(e.to_string())),
        Err(_elapsed) => Err(ServerError::AcceptTimeout),
    }
}

/// Worker-side main loop for the process driver: read [`StartupData`] from
/// the environment, validate the serializer, accept the host connection
/// within the server-connect deadline, then run `build` to install
/// handlers and serve. Exits the process on startup failure.
///
/// When `reconnectable` is true, a connection that ends without a fatal
/// transport error does not terminate the process: the listener is reset
/// and the loop waits (with no deadline) for the host to reconnect, per
/// the process driver's `{reconnect: true}` capability.
pub async fn run_process_worker<F>(reconnectable: bool, build: F) -> !
where
    F: Fn(&mut WorkerServer),
{
    let Some(startup) = StartupData::from_env() else {
        tracing::error!("no startup data found in the environment, exiting");
        std::process::exit(1);
    };

    let expected_serializer = crate::serializer::JsonSerializer.class_name();
    if startup.serializer != expected_serializer {
        tracing::error!(
            expected = expected_serializer,
            actual = %startup.serializer,
            "serializer mismatch, exiting"
        );
        std::process::exit(1);
    }

    let Some(path) = startup.socket_path.as_deref() else {
        tracing::error!("process driver startup data missing socketPath, exiting");
        std::process::exit(1);
    };

    let listener = match SocketListener::bind(path) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind worker endpoint, exiting");
            std::process::exit(1);
        }
    };

    let deadline = Duration::from_millis(startup.server_connect_timeout_ms);
    let mut first = true;

    loop {
        let accept_result = if first {
            accept_with_deadline(&listener, deadline).await
        } else {
            listener
                .accept()
                .await
                .map_err(|e| ServerError::AcceptFailed(e.to_string()))
        };
        first = false;

        let (tx, rx) = match accept_result {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(error = %e, "no host connected in time, exiting");
                listener.cleanup().await;
                std::process::exit(1);
            }
        };

        let mut server = WorkerServer::from_transport(tx, rx, Arc::new(crate::serializer::JsonSerializer));
        build(&mut server);

        let result = server.run().await;
        match result {
            Ok(()) | Err(ServerError::Transport(_)) if reconnectable => {
                tracing::info!("connection ended, awaiting reconnect");
                #[cfg(unix)]
                listener.reset();
                #[cfg(windows)]
                if let Err(e) = listener.reset().await {
                    tracing::error!(error = %e, "failed to reset listener for reconnect, exiting");
                    listener.cleanup().await;
                    std::process::exit(1);
                }
            }
            Ok(()) => {
                listener.cleanup().await;
                std::process::exit(0);
            }
            Err(e) => {
                tracing::warn!(error = %e, "worker server loop ended");
                listener.cleanup().await;
                std::process::exit(0);
            }
        }
    }
}
