//! Stream-socket transport: a Unix domain socket on POSIX, a named pipe on
//! Windows. The worker binds and accepts at most one connection; the host
//! connects.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use super::{TransportRx, TransportTx};

/// Error surfaced by the stream-socket transport.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("a host connection is already active on this endpoint")]
    AlreadyConnected,
}

/// Build the POSIX endpoint path for a fresh worker: `<tmpdir>/worker-<uuid>.sock`.
pub fn posix_endpoint_path() -> PathBuf {
    std::env::temp_dir().join(format!("worker-{}.sock", uuid::Uuid::new_v4()))
}

/// Build the Windows endpoint name for a fresh worker: `\\.\pipe\worker-<uuid>`.
pub fn windows_endpoint_name() -> String {
    format!(r"\\.\pipe\worker-{}", uuid::Uuid::new_v4())
}

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use tokio::net::{UnixListener, UnixStream};

    /// Binds an endpoint path and accepts exactly one host connection.
    pub struct SocketListener {
        inner: UnixListener,
        accepted: Arc<AtomicBool>,
        path: PathBuf,
    }

    impl SocketListener {
        pub fn bind(path: impl AsRef<Path>) -> Result<Self, SocketError> {
            let path = path.as_ref().to_path_buf();
            let inner = UnixListener::bind(&path)?;
            Ok(Self {
                inner,
                accepted: Arc::new(AtomicBool::new(false)),
                path,
            })
        }

        /// Accept the currently permitted connection. A second call made
        /// while one connection is already active is refused; call
        /// [`SocketListener::reset`] after the active connection ends to
        /// permit the next one (used for reconnect).
        pub async fn accept(&self) -> Result<(SocketTx, SocketRx), SocketError> {
            if self.accepted.swap(true, Ordering::SeqCst) {
                return Err(SocketError::AlreadyConnected);
            }
            let (stream, _addr) = self.inner.accept().await?;
            let (rx, tx) = stream.into_split();
            Ok((SocketTx { half: tx }, SocketRx { half: rx, buf: vec![0u8; 64 * 1024] }))
        }

        /// Permit one more [`SocketListener::accept`] call. Used by a
        /// reconnect-capable worker loop once the prior connection has
        /// ended.
        pub fn reset(&self) {
            self.accepted.store(false, Ordering::SeqCst);
        }

        /// Remove the socket file. Best-effort; errors are logged, not
        /// propagated.
        pub async fn cleanup(&self) {
            if let Err(e) = tokio::fs::remove_file(&self.path).await {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to unlink socket endpoint");
            }
        }
    }

    pub struct SocketTx {
        half: tokio::net::unix::OwnedWriteHalf,
    }

    impl TransportTx for SocketTx {
        type Error = io::Error;

        async fn send(&mut self, data: Vec<u8>) -> Result<(), io::Error> {
            use tokio::io::AsyncWriteExt;
            self.half.write_all(&data).await
        }
    }

    pub struct SocketRx {
        half: tokio::net::unix::OwnedReadHalf,
        buf: Vec<u8>,
    }

    impl TransportRx for SocketRx {
        type Error = io::Error;

        async fn receive(&mut self) -> Result<Vec<u8>, io::Error> {
            use tokio::io::AsyncReadExt;
            let n = self.half.read(&mut self.buf).await?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "remote closed"));
            }
            Ok(self.buf[..n].to_vec())
        }
    }

    /// Connect to an already-bound endpoint (host side).
    pub async fn connect(path: impl AsRef<Path>) -> Result<(SocketTx, SocketRx), SocketError> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        let (rx, tx) = stream.into_split();
        Ok((SocketTx { half: tx }, SocketRx { half: rx, buf: vec![0u8; 64 * 1024] }))
    }
}

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, ServerOptions};

    pub struct SocketListener {
        inner: tokio::sync::Mutex<Option<NamedPipeServer>>,
        accepted: Arc<AtomicBool>,
        name: String,
    }

    impl SocketListener {
        pub fn bind(name: impl AsRef<str>) -> Result<Self, SocketError> {
            let name = name.as_ref().to_string();
            let server = ServerOptions::new().first_pipe_instance(true).create(&name)?;
            Ok(Self {
                inner: tokio::sync::Mutex::new(Some(server)),
                accepted: Arc::new(AtomicBool::new(false)),
                name,
            })
        }

        pub async fn accept(&self) -> Result<(SocketTx, SocketRx), SocketError> {
            if self.accepted.swap(true, Ordering::SeqCst) {
                return Err(SocketError::AlreadyConnected);
            }
            let mut guard = self.inner.lock().await;
            let server = guard.take().expect("accept called at most once");
            server.connect().await?;
            let (rx, tx) = tokio::io::split(server);
            Ok((SocketTx { half: tx }, SocketRx { half: rx, buf: vec![0u8; 64 * 1024] }))
        }

        pub async fn cleanup(&self) {
            // Windows named pipes are destroyed automatically once every
            // handle is closed; nothing to unlink.
        }

        /// Permit one more [`SocketListener::accept`] call by creating a
        /// fresh pipe instance under the same name.
        pub async fn reset(&self) -> Result<(), SocketError> {
            let server = ServerOptions::new().create(&self.name)?;
            *self.inner.lock().await = Some(server);
            self.accepted.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    pub struct SocketTx {
        half: tokio::io::WriteHalf<NamedPipeServer>,
    }

    impl TransportTx for SocketTx {
        type Error = io::Error;

        async fn send(&mut self, data: Vec<u8>) -> Result<(), io::Error> {
            use tokio::io::AsyncWriteExt;
            self.half.write_all(&data).await
        }
    }

    pub struct SocketRx {
        half: tokio::io::ReadHalf<NamedPipeServer>,
        buf: Vec<u8>,
    }

    impl TransportRx for SocketRx {
        type Error = io::Error;

        async fn receive(&mut self) -> Result<Vec<u8>, io::Error> {
            use tokio::io::AsyncReadExt;
            let n = self.half.read(&mut self.buf).await?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "remote closed"));
            }
            Ok(self.buf[..n].to_vec())
        }
    }

    pub async fn connect(name: impl AsRef<str>) -> Result<(SocketTx, SocketRx), SocketError> {
        let client = ClientOptions::new().open(name.as_ref())?;
        let (rx, tx) = tokio::io::split(client);
        Ok((SocketTx { half: tx }, SocketRx { half: rx, buf: vec![0u8; 64 * 1024] }))
    }
}

#[cfg(unix)]
pub use unix_impl::*;

#[cfg(windows)]
pub use windows_impl::*;
