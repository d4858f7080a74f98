//! The host-side client: spawns a worker through a [`Driver`], keeps a
//! [`PendingTable`] of in-flight requests, and applies the shutdown/retry
//! policy on worker crash.

mod config;
mod id;
mod pending;

pub use config::{HostClientConfig, SERVER_CONNECT, WORKER_MESSAGE, WORKER_STARTUP};
pub use id::{DefaultTxIdGenerator, TxIdGenerator};
pub use pending::{PendingEntry, PendingTable};

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::connection::Connection;
use crate::driver::{Driver, WorkerHandle};
use crate::error::{ClientError, ShutdownReason};
use crate::policy::Strategy;
use crate::wire::Frame;

/// `Spawning -> Ready -> (Ready | Disconnected)* -> Closing -> Closed`.
/// `Disconnected -> Ready` only via a successful [`HostClient::reconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HostClientState {
    Spawning = 0,
    Ready = 1,
    Disconnected = 2,
    Closing = 3,
    Closed = 4,
}

impl HostClientState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => HostClientState::Spawning,
            1 => HostClientState::Ready,
            2 => HostClientState::Disconnected,
            3 => HostClientState::Closing,
            _ => HostClientState::Closed,
        }
    }
}

struct Inner {
    state: AtomicU8,
    /// Set by [`watch_worker_exit`] as soon as the driver reports the
    /// worker's termination, before it attempts to claim the crash
    /// transition. Lets a concurrent [`handle_disconnect`] defer to the
    /// crash path instead of racing it for the same `Ready -> Disconnected`
    /// edge.
    exit_observed: std::sync::atomic::AtomicBool,
    driver: Box<dyn Driver>,
    connection: Mutex<Option<Connection>>,
    handle: Mutex<Option<Box<dyn WorkerHandle>>>,
    pending: PendingTable,
    config: HostClientConfig,
    respawn_lock: Mutex<()>,
}

/// A live connection to one worker, spawned and supervised through a
/// [`Driver`].
pub struct HostClient {
    inner: Arc<Inner>,
}

impl HostClient {
    /// Spawn a worker via `driver` and wait for the initial connection,
    /// bounded by [`HostClientConfig::worker_startup_timeout`].
    pub async fn spawn(driver: impl Driver, config: HostClientConfig) -> Result<Self, ClientError> {
        let startup_timeout = config.worker_startup_timeout();
        let inner = Arc::new(Inner {
            state: AtomicU8::new(HostClientState::Spawning as u8),
            exit_observed: std::sync::atomic::AtomicBool::new(false),
            driver: Box::new(driver),
            connection: Mutex::new(None),
            handle: Mutex::new(None),
            pending: PendingTable::new(),
            config,
            respawn_lock: Mutex::new(()),
        });

        let spawned = tokio::time::timeout(startup_timeout, inner.driver.spawn())
            .await
            .map_err(|_| ClientError::ConnectTimeout)??;

        wire_connection(&inner, &spawned.connection).await;
        *inner.connection.lock().await = Some(spawned.connection);
        *inner.handle.lock().await = Some(spawned.handle);
        inner.state.store(HostClientState::Ready as u8, Ordering::SeqCst);

        watch_worker_exit(inner.clone());

        Ok(Self { inner })
    }

    pub fn state(&self) -> HostClientState {
        HostClientState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Send a request, awaiting the matching response (or timeout, or
    /// disconnect) per the effective per-message-type timeout.
    pub async fn send(&self, kind: impl Into<String>, payload: Value) -> Result<Value, ClientError> {
        let kind = kind.into();
        match self.state() {
            HostClientState::Closed | HostClientState::Closing => return Err(ClientError::WorkerClosed),
            HostClientState::Disconnected => return Err(ClientError::Disconnected),
            HostClientState::Spawning => return Err(ClientError::WorkerInactive),
            HostClientState::Ready => {}
        }

        let tx = self.inner.config.tx_id_generator.next();
        let timeout = self.inner.config.effective_timeout(&kind);
        let deadline = Instant::now() + timeout;
        let strategy = self.inner.config.retry_policy.strategy_for(&kind);
        let retry_budget = strategy.max_attempts().saturating_sub(1);

        let receiver = self
            .inner
            .pending
            .insert(tx.clone(), kind.clone(), payload.clone(), deadline, retry_budget)
            .await;

        let frame = Frame::request(tx.clone(), kind, payload);
        let send_result = {
            let guard = self.inner.connection.lock().await;
            match guard.as_ref() {
                Some(conn) => conn.send(frame).await,
                None => Err(ClientError::NotConnected),
            }
        };
        if let Err(e) = send_result {
            self.inner.pending.remove(&tx).await;
            return Err(e);
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_canceled)) => Err(ClientError::Disconnected),
            Err(_elapsed) => {
                self.inner.pending.remove(&tx).await;
                Err(ClientError::Timeout)
            }
        }
    }

    /// Send a one-way message: write the frame and return once it's on the
    /// wire, without waiting for (or expecting) a response. Pairs with a
    /// worker handler registered via
    /// [`WorkerServer::register_one_way`](crate::server::WorkerServer::register_one_way),
    /// which never writes a response frame back.
    pub async fn notify(&self, kind: impl Into<String>, payload: Value) -> Result<(), ClientError> {
        let kind = kind.into();
        match self.state() {
            HostClientState::Closed | HostClientState::Closing => return Err(ClientError::WorkerClosed),
            HostClientState::Disconnected => return Err(ClientError::Disconnected),
            HostClientState::Spawning => return Err(ClientError::WorkerInactive),
            HostClientState::Ready => {}
        }

        let tx = self.inner.config.tx_id_generator.next();
        let frame = Frame::request(tx, kind, payload);
        let guard = self.inner.connection.lock().await;
        match guard.as_ref() {
            Some(conn) => conn.send(frame).await,
            None => Err(ClientError::NotConnected),
        }
    }

    /// Close the transport without terminating the worker. Only meaningful
    /// when the active driver supports it.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.inner.driver.disconnect().await?;
        if let Some(mut conn) = self.inner.connection.lock().await.take() {
            conn.close().await;
        }
        self.inner.state.store(HostClientState::Disconnected as u8, Ordering::SeqCst);
        for entry in self.inner.pending.drain().await {
            entry.fail(ClientError::Disconnected);
        }
        Ok(())
    }

    /// Re-establish a connection to the surviving worker. No pending
    /// entries are replayed by this call.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        let connection = self.inner.driver.reconnect().await?;
        wire_connection(&self.inner, &connection).await;
        *self.inner.connection.lock().await = Some(connection);
        self.inner.state.store(HostClientState::Ready as u8, Ordering::SeqCst);
        Ok(())
    }

    /// Fail every pending entry, close the transport, and terminate the
    /// worker.
    pub async fn close(&self) {
        self.inner.state.store(HostClientState::Closing as u8, Ordering::SeqCst);
        for entry in self.inner.pending.drain().await {
            entry.fail(ClientError::WorkerClosed);
        }
        if let Some(mut conn) = self.inner.connection.lock().await.take() {
            conn.close().await;
        }
        if let Some(mut handle) = self.inner.handle.lock().await.take() {
            handle.kill().await;
        }
        self.inner.state.store(HostClientState::Closed as u8, Ordering::SeqCst);
    }
}

async fn wire_connection(inner: &Arc<Inner>, connection: &Connection) {
    let inner_msg = inner.clone();
    connection
        .on_message(move |frame| {
            let inner = inner_msg.clone();
            tokio::spawn(async move {
                route_incoming(inner, frame).await;
            });
        })
        .await;

    let inner_close = inner.clone();
    connection
        .on_close(move || {
            let inner = inner_close.clone();
            tokio::spawn(async move {
                handle_disconnect(inner).await;
            });
        })
        .await;
}

async fn route_incoming(inner: Arc<Inner>, frame: Frame) {
    if frame.is_result() {
        let tx = frame.tx.clone();
        if !inner.pending.resolve(&tx, Ok(frame.payload)).await {
            tracing::trace!(tx = %tx, "dropping result frame for unknown transaction");
        }
    } else if frame.is_error() {
        let tx = frame.tx.clone();
        match frame.error_payload() {
            Ok(err) => {
                if !inner.pending.resolve(&tx, Err(ClientError::from_wire(err))).await {
                    tracing::trace!(tx = %tx, "dropping error frame for unknown transaction");
                }
            }
            Err(e) => tracing::warn!(error = %e, "received an error frame with an unparseable payload"),
        }
    } else {
        tracing::warn!(kind = %frame.kind, "host received a non-response frame, dropping");
    }
}

/// Spawn a background task that awaits the worker's termination and drives
/// the shutdown/retry policy once it does.
fn watch_worker_exit(inner: Arc<Inner>) {
    tokio::spawn(async move {
        let reason = {
            let mut guard = inner.handle.lock().await;
            match guard.as_mut() {
                Some(handle) => handle.wait_exit().await,
                None => return,
            }
        };
        // Mark the exit as observed before anything else so a concurrent
        // `handle_disconnect` sees it and defers instead of racing us for
        // the `Ready -> Disconnected` transition.
        inner.exit_observed.store(true, Ordering::SeqCst);
        if matches!(
            HostClientState::from_u8(inner.state.load(Ordering::SeqCst)),
            HostClientState::Closing | HostClientState::Closed
        ) {
            return;
        }
        handle_crash(inner, reason).await;
    });
}

/// The connection's `on_close` fired. Distinguishes a worker crash (the
/// process has already terminated, and `watch_worker_exit` is driving or
/// about to drive the crash path) from a transport-only disconnect.
async fn handle_disconnect(inner: Arc<Inner>) {
    let state = HostClientState::from_u8(inner.state.load(Ordering::SeqCst));
    if matches!(state, HostClientState::Closing | HostClientState::Closed) {
        return;
    }
    if inner.exit_observed.load(Ordering::SeqCst) {
        // The worker has already terminated; `handle_crash` owns the
        // `Ready -> Disconnected` transition and the retry policy.
        return;
    }

    let claimed_by_us = inner
        .state
        .compare_exchange(
            HostClientState::Ready as u8,
            HostClientState::Disconnected as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        )
        .is_ok();
    if !claimed_by_us {
        // `handle_crash` already claimed the transition; nothing left for
        // us to do.
        return;
    }

    tracing::debug!("connection closed with worker still alive, failing pending entries");
    for entry in inner.pending.drain().await {
        entry.fail(ClientError::Disconnected);
    }
}

/// A worker crash was observed. Classify every pending entry by its message
/// type's strategy, respawn once (single-flight), and replay the entries
/// whose retry budget survives.
async fn handle_crash(inner: Arc<Inner>, reason: ShutdownReason) {
    let claimed_by_us = inner
        .state
        .compare_exchange(
            HostClientState::Ready as u8,
            HostClientState::Disconnected as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        )
        .is_ok();
    if !claimed_by_us {
        // `handle_disconnect` already claimed the transition (or the
        // client moved on to Closing/Closed); defer to it.
        return;
    }
    if let Some(mut conn) = inner.connection.lock().await.take() {
        conn.close().await;
    }

    let pending = inner.pending.drain().await;
    let mut to_retry = Vec::new();
    for entry in pending {
        let strategy = inner.config.retry_policy.strategy_for(&entry.kind);
        let attempt = strategy.max_attempts().saturating_sub(entry.retry_budget_remaining);
        match strategy {
            Strategy::Reject => entry.fail(ClientError::WorkerCrashed {
                reason: reason.clone(),
                attempt: 1,
                max_attempts: 1,
            }),
            Strategy::Retry { attempts } if entry.retry_budget_remaining == 0 => {
                entry.fail(ClientError::WorkerCrashed {
                    reason: reason.clone(),
                    attempt,
                    max_attempts: attempts,
                });
            }
            Strategy::Retry { .. } => to_retry.push(entry),
        }
    }

    let _guard = inner.respawn_lock.lock().await;
    if matches!(
        HostClientState::from_u8(inner.state.load(Ordering::SeqCst)),
        HostClientState::Closing | HostClientState::Closed
    ) {
        for entry in to_retry {
            entry.fail(ClientError::WorkerClosed);
        }
        return;
    }

    match inner.driver.spawn().await {
        Ok(spawned) => {
            wire_connection(&inner, &spawned.connection).await;
            *inner.connection.lock().await = Some(spawned.connection);
            *inner.handle.lock().await = Some(spawned.handle);
            inner.exit_observed.store(false, Ordering::SeqCst);
            inner.state.store(HostClientState::Ready as u8, Ordering::SeqCst);

            for entry in to_retry {
                let strategy = inner.config.retry_policy.strategy_for(&entry.kind);
                let attempt = strategy.max_attempts().saturating_sub(entry.retry_budget_remaining);
                let new_tx = inner.config.tx_id_generator.next();
                let (new_tx, entry) = entry.rekey(new_tx);
                let frame = Frame::request(new_tx.clone(), entry.kind.clone(), entry.payload.clone());
                inner.pending.reinsert(new_tx.clone(), entry).await;

                let send_result = {
                    let guard = inner.connection.lock().await;
                    match guard.as_ref() {
                        Some(conn) => conn.send(frame).await,
                        None => Err(ClientError::NotConnected),
                    }
                };
                if send_result.is_err() {
                    if let Some(entry) = inner.pending.remove(&new_tx).await {
                        entry.fail(ClientError::WorkerCrashed {
                            reason: reason.clone(),
                            attempt,
                            max_attempts: strategy.max_attempts(),
                        });
                    }
                }
            }

            watch_worker_exit(inner.clone());
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to respawn worker after crash");
            for entry in to_retry {
                let strategy = inner.config.retry_policy.strategy_for(&entry.kind);
                let attempt = strategy.max_attempts().saturating_sub(entry.retry_budget_remaining);
                entry.fail(ClientError::WorkerCrashed {
                    reason: reason.clone(),
                    attempt,
                    max_attempts: strategy.max_attempts(),
                });
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::thread::{ThreadDriver, ThreadWorkerInit};
    use crate::serializer::JsonSerializer;
    use crate::server::{ServerConfig, WorkerServer};
    use serde_json::json;

    fn echo_driver() -> ThreadDriver {
        ThreadDriver::new(|init: ThreadWorkerInit| async move {
            let mut server = WorkerServer::new(init.port, Arc::new(JsonSerializer), ServerConfig::default());
            server.register("echo", |payload| async move { payload });
            let _ = server.run().await;
        })
    }

    #[tokio::test]
    async fn send_round_trips_through_a_thread_worker() {
        let client = HostClient::spawn(echo_driver(), HostClientConfig::default())
            .await
            .unwrap();
        let result = client.send("echo", json!("hello")).await.unwrap();
        assert_eq!(result, json!("hello"));
        client.close().await;
    }

    #[tokio::test]
    async fn handler_error_surfaces_as_handler_error() {
        let driver = ThreadDriver::new(|init: ThreadWorkerInit| async move {
            let mut server = WorkerServer::new(init.port, Arc::new(JsonSerializer), ServerConfig::default());
            server.register_fallible("divide", |_payload| async move {
                Err(crate::error::SerializedError::new("DivideByZero", "cannot divide by zero"))
            });
            let _ = server.run().await;
        });

        let client = HostClient::spawn(driver, HostClientConfig::default()).await.unwrap();
        let err = client.send("divide", json!({"a": 1, "b": 0})).await.unwrap_err();
        match err {
            ClientError::HandlerError { name, .. } => assert_eq!(name, "DivideByZero"),
            other => panic!("unexpected error: {other:?}"),
        }
        client.close().await;
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let client = HostClient::spawn(echo_driver(), HostClientConfig::default())
            .await
            .unwrap();
        client.close().await;
        let err = client.send("echo", json!("hi")).await.unwrap_err();
        assert!(matches!(err, ClientError::WorkerClosed));
    }
}
