//! Process driver: spawns an out-of-process worker over a stream-socket
//! transport.
//!
//! Capabilities `{reconnect: true, detached: true, shared_memory: false}`.
//! Startup data is injected through an environment variable, bound to a
//! freshly generated, unique endpoint name.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use super::{Driver, DriverCapabilities, Spawned, WorkerHandle};
use crate::connection::{connect_with_retry, erase, Connection, ConnectRetryPolicy};
use crate::error::{ClientError, ShutdownReason};
use crate::serializer::{JsonSerializer, Serializer};
use crate::startup::{DriverKind, StartupData, ENV_STARTUP_DATA};
use crate::transport::socket;

/// Where the worker process is released from the parent's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachMode {
    /// The worker is killed if the host process exits (the default).
    Attached,
    /// The worker survives the host process exiting.
    Detached,
}

/// Spawns a child process per [`ProcessDriver::spawn`] call.
pub struct ProcessDriver {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    server_connect_timeout: Duration,
    connect_retry: ConnectRetryPolicy,
    detach: DetachMode,
    endpoint: std::sync::Mutex<Option<PathBuf>>,
}

impl ProcessDriver {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            server_connect_timeout: Duration::from_secs(30),
            connect_retry: ConnectRetryPolicy::default(),
            detach: DetachMode::Attached,
            endpoint: std::sync::Mutex::new(None),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn with_server_connect_timeout(mut self, timeout: Duration) -> Self {
        self.server_connect_timeout = timeout;
        self
    }

    pub fn with_connect_retry(mut self, policy: ConnectRetryPolicy) -> Self {
        self.connect_retry = policy;
        self
    }

    pub fn detached(mut self) -> Self {
        self.detach = DetachMode::Detached;
        self
    }
}

struct ProcessHandle {
    child: Child,
}

#[async_trait]
impl WorkerHandle for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait_exit(&mut self) -> ShutdownReason {
        match self.child.wait().await {
            Ok(status) => {
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    if let Some(signal) = status.signal() {
                        return ShutdownReason::Signal(signal.to_string());
                    }
                }
                ShutdownReason::ExitCode(status.code().unwrap_or(-1))
            }
            Err(e) => ShutdownReason::TransportError(e.to_string()),
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::warn!(error = %e, "failed to kill worker process");
        }
    }
}

#[async_trait]
impl Driver for ProcessDriver {
    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            reconnect: true,
            detached: true,
            shared_memory: false,
        }
    }

    async fn spawn(&self) -> Result<Spawned, ClientError> {
        #[cfg(unix)]
        let endpoint = socket::posix_endpoint_path();
        #[cfg(windows)]
        let endpoint = PathBuf::from(socket::windows_endpoint_name());

        let startup = StartupData {
            driver: DriverKind::ChildProcess,
            socket_path: Some(endpoint.to_string_lossy().into_owned()),
            serializer: JsonSerializer.class_name().to_string(),
            server_connect_timeout_ms: self.server_connect_timeout.as_millis() as u64,
        };
        let startup_json = startup
            .to_env_json()
            .map_err(|e| ClientError::Serializer(crate::serializer::SerializerError::Encode(e)))?;

        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command.env(ENV_STARTUP_DATA, &startup_json);
        for (k, v) in &self.envs {
            command.env(k, v);
        }
        // A detached worker is released from parent-lifetime coupling: it is
        // not killed when this driver (or the host process) goes away.
        command.kill_on_drop(self.detach == DetachMode::Attached);

        let child = command
            .spawn()
            .map_err(|e| ClientError::ConnectRefused(format!("failed to spawn worker process: {e}")))?;

        *self.endpoint.lock().unwrap() = Some(endpoint.clone());

        let path = endpoint.clone();
        let (tx, rx) = connect_with_retry(&self.connect_retry, || {
            let path = path.clone();
            async move { socket::connect(&path).await }
        })
        .await?;

        let (tx, rx) = erase(tx, rx);
        let connection = Connection::new(tx, rx, Arc::new(JsonSerializer));

        Ok(Spawned {
            connection,
            handle: Box::new(ProcessHandle { child }),
        })
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn reconnect(&self) -> Result<Connection, ClientError> {
        let endpoint = self
            .endpoint
            .lock()
            .unwrap()
            .clone()
            .ok_or(ClientError::WorkerInactive)?;

        let (tx, rx) = connect_with_retry(&self.connect_retry, || {
            let endpoint = endpoint.clone();
            async move { socket::connect(&endpoint).await }
        })
        .await?;

        let (tx, rx) = erase(tx, rx);
        Ok(Connection::new(tx, rx, Arc::new(JsonSerializer)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn capabilities_match_out_of_process_worker() {
        let driver = ProcessDriver::new("true");
        let caps = driver.capabilities();
        assert!(caps.reconnect);
        assert!(caps.detached);
        assert!(!caps.shared_memory);
    }

    #[tokio::test]
    async fn connects_to_a_real_echo_worker() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("test-worker.sock");

        let listener = socket::SocketListener::bind(&socket_path).unwrap();
        let accept_task = tokio::spawn({
            let listener_path = socket_path.clone();
            async move {
                let listener = listener;
                let _ = listener.accept().await;
                let _ = listener_path;
            }
        });

        let retry = ConnectRetryPolicy::default();
        let connect_result = connect_with_retry(&retry, || {
            let path = socket_path.clone();
            async move { socket::connect(&path).await }
        })
        .await;
        assert!(connect_result.is_ok());
        accept_task.await.unwrap();
    }
}
