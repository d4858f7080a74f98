//! Driver abstraction.
//!
//! A driver knows how to produce a worker execution context from a command
//! plus options, deliver startup data, and create the matching transport
//! end. Two standard drivers ship with the crate: [`process`] (an
//! out-of-process child) and [`thread`] (an in-process worker-thread-like
//! context over an in-memory port).

pub mod process;
pub mod thread;

use async_trait::async_trait;

use crate::connection::Connection;
use crate::error::{ClientError, ShutdownReason};

/// Capability flags a driver advertises, rather than every driver
/// implementing every method; unsupported operations return
/// [`ClientError::NotSupported`] at runtime instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverCapabilities {
    pub reconnect: bool,
    pub detached: bool,
    pub shared_memory: bool,
}

/// A handle onto one spawned worker's execution context: its process/task
/// identity and termination.
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    /// The OS process id, if this driver exposes one (the thread driver
    /// does not have one.)
    fn pid(&self) -> Option<u32>;

    /// Block until the worker terminates, classifying the cause into one
    /// of the four termination categories.
    async fn wait_exit(&mut self) -> ShutdownReason;

    /// Forcefully terminate the worker.
    async fn kill(&mut self);
}

/// A freshly spawned worker: its connection plus its handle.
pub struct Spawned {
    pub connection: Connection,
    pub handle: Box<dyn WorkerHandle>,
}

/// Strategy for producing a worker execution context and the matching
/// transport end.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    fn capabilities(&self) -> DriverCapabilities;

    /// Spawn a fresh worker and connect to it, applying the driver's own
    /// connect retry policy.
    async fn spawn(&self) -> Result<Spawned, ClientError>;

    /// Close the transport without terminating the worker. Only meaningful
    /// when `capabilities().reconnect` is true; other drivers return
    /// [`ClientError::NotSupported`].
    async fn disconnect(&self) -> Result<(), ClientError> {
        Err(ClientError::NotSupported("disconnect"))
    }

    /// Re-establish a connection to the still-alive worker spawned by the
    /// most recent [`Driver::spawn`] call. Only meaningful when
    /// `capabilities().reconnect` is true.
    async fn reconnect(&self) -> Result<Connection, ClientError> {
        Err(ClientError::NotSupported("reconnect"))
    }
}
