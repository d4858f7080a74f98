//! Error taxonomy shared by the host client and the worker server.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The categorized cause of a worker termination.
///
/// Mirrors the four termination categories a [`Driver`](crate::driver::Driver)
/// reports to the host client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownReason {
    /// The worker exited with the given status code.
    ExitCode(i32),
    /// The worker was terminated by a signal, recorded by name.
    Signal(String),
    /// A local transport error (not a remote event) tore down the connection.
    TransportError(String),
    /// The remote end closed its half of the connection.
    RemoteClose,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::ExitCode(code) => write!(f, "exited with code {code}"),
            ShutdownReason::Signal(sig) => write!(f, "terminated by signal {sig}"),
            ShutdownReason::TransportError(msg) => write!(f, "transport error: {msg}"),
            ShutdownReason::RemoteClose => write!(f, "remote closed"),
        }
    }
}

/// The wire representation of an error produced by a worker handler.
///
/// `message` and `name` are required, `stack` and `code` are optional. The
/// host reconstructs a [`ClientError::HandlerError`] from this, preserving
/// `name`, `message`, and `code`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedError {
    pub message: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl SerializedError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Failures surfaced to the caller of [`HostClient::send`](crate::host_client::HostClient::send).
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection setup did not complete within its retry budget.
    #[error("connect timed out after exhausting the retry budget")]
    ConnectTimeout,
    /// The worker actively refused the connection attempt.
    #[error("connection refused by worker: {0}")]
    ConnectRefused(String),
    /// A per-request deadline elapsed with no response.
    #[error("request timed out waiting for a response")]
    Timeout,
    /// The transport closed while the request was in flight and the worker
    /// is still alive.
    #[error("disconnected while request was in flight")]
    Disconnected,
    /// The worker terminated while the request was in flight.
    #[error("worker crashed ({reason}), attempt {attempt} of {max_attempts}")]
    WorkerCrashed {
        reason: ShutdownReason,
        attempt: u32,
        max_attempts: u32,
    },
    /// The worker's handler raised; reconstructed from the wire error.
    #[error("handler error {name}: {message}")]
    HandlerError {
        name: String,
        message: String,
        code: Option<String>,
    },
    /// The worker had no handler registered for the requested message type.
    #[error("unknown message type {kind}")]
    UnknownMessageType { kind: String },
    /// The worker's serializer identifier did not match the host's at startup.
    #[error("serializer mismatch: host uses {expected}, worker reported {actual}")]
    SerializerMismatch { expected: String, actual: String },
    /// An operation was attempted on a client whose worker has exited.
    #[error("worker is not active")]
    WorkerInactive,
    /// An operation was attempted on a client that has been closed.
    #[error("worker client has been closed")]
    WorkerClosed,
    /// The active driver does not support this operation.
    #[error("operation not supported by the active driver: {0}")]
    NotSupported(&'static str),
    /// The connection is not currently open.
    #[error("not connected")]
    NotConnected,
    /// A local I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A frame failed to encode or decode.
    #[error("serializer error: {0}")]
    Serializer(#[from] crate::serializer::SerializerError),
}

impl ClientError {
    /// Reconstruct a [`ClientError::HandlerError`] from a wire-format error.
    pub fn from_wire(err: SerializedError) -> Self {
        ClientError::HandlerError {
            name: err.name,
            message: err.message,
            code: err.code,
        }
    }
}
