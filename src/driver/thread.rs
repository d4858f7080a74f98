//! Thread driver: an in-process worker-thread-like execution context over
//! an in-memory port pair.
//!
//! Capabilities `{reconnect: false, detached: false, shared_memory: true}`.
//! Startup data is handed to the spawned task directly as a Rust value —
//! no JSON round-trip is needed since both sides share an address space —
//! but it is still shaped as [`StartupData`] for parity with the process
//! driver.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use super::{Driver, DriverCapabilities, Spawned, WorkerHandle};
use crate::connection::{erase, Connection};
use crate::error::{ClientError, ShutdownReason};
use crate::serializer::{JsonSerializer, Serializer};
use crate::startup::{DriverKind, StartupData};
use crate::transport::port::{self, PortEnd};



type EntryFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type EntryFn = dyn Fn(ThreadWorkerInit) -> EntryFuture + Send + Sync;

/// What the spawned task receives: its half of the in-memory port, plus
/// the same startup data a process-driver worker would read from its
/// environment.
pub struct ThreadWorkerInit {
    pub port: PortEnd,
    pub startup: StartupData,
}

/// Spawns an in-process "worker-thread" task per `spawn()` call.
pub struct ThreadDriver {
    entry: Arc<EntryFn>,
    server_connect_timeout: Duration,
}

impl ThreadDriver {
    /// `entry` is the worker's body: it owns the port end and the startup
    /// data, and is expected to run a [`WorkerServer`](crate::server::WorkerServer)
    /// loop until its connection closes.
    pub fn new<F, Fut>(entry: F) -> Self
    where
        F: Fn(ThreadWorkerInit) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            entry: Arc::new(move |init| Box::pin(entry(init)) as EntryFuture),
            server_connect_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_server_connect_timeout(mut self, timeout: Duration) -> Self {
        self.server_connect_timeout = timeout;
        self
    }
}

struct ThreadHandle {
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl WorkerHandle for ThreadHandle {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn wait_exit(&mut self) -> ShutdownReason {
        match self.task.take() {
            Some(task) => match task.await {
                Ok(()) => ShutdownReason::ExitCode(0),
                Err(e) if e.is_panic() => ShutdownReason::Signal("panic".to_string()),
                Err(_) => ShutdownReason::RemoteClose,
            },
            None => ShutdownReason::RemoteClose,
        }
    }

    async fn kill(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Driver for ThreadDriver {
    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            reconnect: false,
            detached: false,
            shared_memory: true,
        }
    }

    async fn spawn(&self) -> Result<Spawned, ClientError> {
        let (host_end, worker_end) = port::pair();
        let startup = StartupData {
            driver: DriverKind::WorkerThreads,
            socket_path: None,
            serializer: JsonSerializer.class_name().to_string(),
            server_connect_timeout_ms: self.server_connect_timeout.as_millis() as u64,
        };

        let entry = self.entry.clone();
        let init = ThreadWorkerInit { port: worker_end, startup };
        let task = tokio::spawn(async move {
            (entry)(init).await;
        });

        let (tx, rx) = erase(host_end.tx, host_end.rx);
        let connection = Connection::new(tx, rx, Arc::new(JsonSerializer));

        Ok(Spawned {
            connection,
            handle: Box::new(ThreadHandle { task: Some(task) }),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::server::{ServerConfig, WorkerServer};
    use crate::wire::Frame;
    use serde_json::json;

    #[tokio::test]
    async fn spawns_and_connects() {
        let driver = ThreadDriver::new(|init: ThreadWorkerInit| async move {
            let mut server = WorkerServer::new(
                init.port,
                Arc::new(JsonSerializer),
                ServerConfig::default(),
            );
            server.register("echo", |payload| async move { payload });
            let _ = server.run().await;
        });

        let spawned = driver.spawn().await.unwrap();
        spawned
            .connection
            .send(Frame::request("tx-1", "echo", json!("hi")))
            .await
            .unwrap();
    }
}
