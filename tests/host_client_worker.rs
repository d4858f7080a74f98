//! End-to-end coverage of the host/worker messaging layer: a `HostClient`
//! driving a `ThreadDriver` worker through the full request/response,
//! timeout, crash, and retry paths, plus a few transport-level boundary
//! checks that don't need a live connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use isolated_workers::connection::{connect_with_retry, erase, ConnectRetryPolicy, Connection};
use isolated_workers::driver::thread::{ThreadDriver, ThreadWorkerInit};
use isolated_workers::driver::{Driver, DriverCapabilities, Spawned, WorkerHandle};
use isolated_workers::error::{SerializedError, ShutdownReason};
use isolated_workers::policy::{RetryPolicy, Strategy};
use isolated_workers::serializer::JsonSerializer;
use isolated_workers::server::{ServerConfig, WorkerServer};
use isolated_workers::transport::port;
use isolated_workers::transport::socket::{self, SocketError, SocketListener};
use isolated_workers::{ClientError, Frame, HostClient, HostClientConfig};

fn echo_server_driver() -> ThreadDriver {
    ThreadDriver::new(|init: ThreadWorkerInit| async move {
        let mut server = WorkerServer::new(init.port, Arc::new(JsonSerializer), ServerConfig::default());
        server.register("echo", |payload| async move { payload });
        let _ = server.run().await;
    })
}

#[tokio::test]
async fn echo_round_trip() {
    let client = HostClient::spawn(echo_server_driver(), HostClientConfig::default())
        .await
        .unwrap();

    let result = client
        .send("echo", json!({"greeting": "hello", "n": 3}))
        .await
        .unwrap();
    assert_eq!(result, json!({"greeting": "hello", "n": 3}));

    client.close().await;
}

#[tokio::test]
async fn handler_error_propagates_as_client_error() {
    let driver = ThreadDriver::new(|init: ThreadWorkerInit| async move {
        let mut server = WorkerServer::new(init.port, Arc::new(JsonSerializer), ServerConfig::default());
        server.register_fallible("divide", |payload| async move {
            let b = payload.get("b").and_then(|v| v.as_i64()).unwrap_or(0);
            if b == 0 {
                Err(SerializedError::new("DivideByZero", "cannot divide by zero").with_code("E_DIV0"))
            } else {
                Ok(json!(payload["a"].as_i64().unwrap() / b))
            }
        });
        let _ = server.run().await;
    });

    let client = HostClient::spawn(driver, HostClientConfig::default()).await.unwrap();

    let ok = client.send("divide", json!({"a": 10, "b": 2})).await.unwrap();
    assert_eq!(ok, json!(5));

    let err = client.send("divide", json!({"a": 10, "b": 0})).await.unwrap_err();
    match err {
        ClientError::HandlerError { name, message, code } => {
            assert_eq!(name, "DivideByZero");
            assert_eq!(message, "cannot divide by zero");
            assert_eq!(code.as_deref(), Some("E_DIV0"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    client.close().await;
}

#[tokio::test]
async fn per_type_timeout_elapses_while_other_types_are_unaffected() {
    let driver = ThreadDriver::new(|init: ThreadWorkerInit| async move {
        let mut server = WorkerServer::new(init.port, Arc::new(JsonSerializer), ServerConfig::default());
        server.register("slow", |payload| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            payload
        });
        server.register("fast", |payload| async move { payload });
        let _ = server.run().await;
    });

    let config = HostClientConfig::default().with_timeout("slow", Duration::from_millis(20));
    let client = HostClient::spawn(driver, config).await.unwrap();

    let err = client.send("slow", json!("late")).await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout));

    // The worker is still alive and the connection unaffected by a timed-out
    // in-flight request; a differently-typed message still round-trips.
    let ok = client.send("fast", json!("quick")).await.unwrap();
    assert_eq!(ok, json!("quick"));

    client.close().await;
}

/// A driver whose worker-termination signal is independent of its
/// transport, mirroring a real out-of-process worker where the OS reports
/// the child's exit on its own schedule rather than as a side effect of the
/// pipe closing. Tests trigger termination explicitly via the returned
/// [`tokio::sync::Notify`] instead of tearing down the connection, so the
/// crash path is exercised deterministically rather than racing against
/// `Connection`'s own close detection.
struct CrashableDriver {
    exit_signal: Arc<tokio::sync::Notify>,
}

impl CrashableDriver {
    fn new() -> (Self, Arc<tokio::sync::Notify>) {
        let exit_signal = Arc::new(tokio::sync::Notify::new());
        (Self { exit_signal: exit_signal.clone() }, exit_signal)
    }
}

struct CrashableHandle {
    exit_signal: Arc<tokio::sync::Notify>,
}

#[async_trait::async_trait]
impl WorkerHandle for CrashableHandle {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn wait_exit(&mut self) -> ShutdownReason {
        self.exit_signal.notified().await;
        ShutdownReason::Signal("killed".to_string())
    }

    async fn kill(&mut self) {}
}

#[async_trait::async_trait]
impl Driver for CrashableDriver {
    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            reconnect: false,
            detached: false,
            shared_memory: true,
        }
    }

    async fn spawn(&self) -> Result<Spawned, ClientError> {
        let (host_end, worker_end) = port::pair();
        tokio::spawn(async move {
            let mut server = WorkerServer::new(worker_end, Arc::new(JsonSerializer), ServerConfig::default());
            server.register("echo", |payload| async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                payload
            });
            let _ = server.run().await;
        });

        let (tx, rx) = erase(host_end.tx, host_end.rx);
        let connection = Connection::new(tx, rx, Arc::new(JsonSerializer));
        Ok(Spawned {
            connection,
            handle: Box::new(CrashableHandle { exit_signal: self.exit_signal.clone() }),
        })
    }
}

#[tokio::test]
async fn crash_with_reject_fails_in_flight_requests() {
    // Default retry policy is Strategy::Reject.
    let (driver, exit_signal) = CrashableDriver::new();
    let client = Arc::new(HostClient::spawn(driver, HostClientConfig::default()).await.unwrap());

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.send("echo", json!("will not survive")).await }
    });

    // Give the in-flight send a moment to register in the pending table
    // before reporting the worker's exit.
    tokio::time::sleep(Duration::from_millis(10)).await;
    exit_signal.notify_one();

    let result = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("task did not finish")
        .unwrap();

    match result {
        Err(ClientError::WorkerCrashed { attempt, max_attempts, .. }) => {
            assert_eq!(attempt, 1);
            assert_eq!(max_attempts, 1);
        }
        other => panic!("expected WorkerCrashed, got {other:?}"),
    }

    client.close().await;
}

#[tokio::test]
async fn crash_with_bounded_retry_succeeds_after_respawn() {
    let (driver, exit_signal) = CrashableDriver::new();
    let retry_policy = RetryPolicy::default().with_override("echo", Strategy::Retry { attempts: 2 });
    let config = HostClientConfig::default().with_retry_policy(retry_policy);
    let client = Arc::new(HostClient::spawn(driver, config).await.unwrap());

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.send("echo", json!("replay me")).await }
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    exit_signal.notify_one();

    let result = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("task did not finish")
        .unwrap();

    assert_eq!(result.unwrap(), json!("replay me"));

    client.close().await;
}

#[tokio::test]
async fn concurrent_requests_all_complete() {
    let driver = ThreadDriver::new(|init: ThreadWorkerInit| async move {
        let mut server = WorkerServer::new(init.port, Arc::new(JsonSerializer), ServerConfig::default());
        server.register("echo", |payload| async move {
            // Small random-ish delay via the payload value, to interleave
            // completion order across the concurrent batch.
            let n = payload.as_i64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis((n % 5) as u64)).await;
            payload
        });
        let _ = server.run().await;
    });

    let client = Arc::new(HostClient::spawn(driver, HostClientConfig::default()).await.unwrap());

    let mut tasks = Vec::new();
    for i in 0..50 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move { client.send("echo", json!(i)).await.unwrap() }));
    }

    for (i, task) in tasks.into_iter().enumerate() {
        let got = task.await.unwrap();
        assert_eq!(got, json!(i as i64));
    }

    client.close().await;
}

#[tokio::test]
async fn unmatched_response_frame_is_dropped_without_disturbing_others() {
    let driver = ThreadDriver::new(|init: ThreadWorkerInit| async move {
        let (tx, rx) = erase(init.port.tx, init.port.rx);
        let worker_conn = Arc::new(Connection::new(tx, rx, Arc::new(JsonSerializer)));
        let wc = worker_conn.clone();
        worker_conn
            .on_message(move |frame| {
                let wc = wc.clone();
                tokio::spawn(async move {
                    // A decoy response addressed to a transaction id that was
                    // never sent; the host must drop it silently.
                    let _ = wc
                        .send(Frame::result("not-a-real-tx", "echo", json!("decoy")))
                        .await;
                    let _ = wc.send(Frame::result(frame.tx.clone(), "echo", frame.payload.clone())).await;
                });
            })
            .await;
        std::future::pending::<()>().await;
    });

    let client = HostClient::spawn(driver, HostClientConfig::default()).await.unwrap();
    let result = client.send("echo", json!("real")).await.unwrap();
    assert_eq!(result, json!("real"));

    client.close().await;
}

#[tokio::test]
async fn a_second_accept_is_refused_while_a_connection_is_active() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("worker.sock");
    let listener = Arc::new(SocketListener::bind(&path).unwrap());

    let accepting = listener.clone();
    let first = tokio::spawn(async move { accepting.accept().await });

    // Yield so the first accept() call registers itself before we race the
    // second one.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = listener.accept().await.unwrap_err();
    assert!(matches!(err, SocketError::AlreadyConnected));

    first.abort();
    listener.cleanup().await;
}

#[tokio::test]
async fn reconnect_is_permitted_after_reset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("worker.sock");
    let listener = SocketListener::bind(&path).unwrap();

    let accept_task = tokio::spawn({
        let path = path.clone();
        async move { socket::connect(&path).await }
    });
    let (_tx, _rx) = listener.accept().await.unwrap();
    accept_task.await.unwrap().unwrap();

    // Before reset, a second accept is refused.
    assert!(matches!(
        listener.accept().await.unwrap_err(),
        SocketError::AlreadyConnected
    ));

    listener.reset();

    let reconnect_task = tokio::spawn({
        let path = path.clone();
        async move { socket::connect(&path).await }
    });
    let (_tx2, _rx2) = listener.accept().await.unwrap();
    reconnect_task.await.unwrap().unwrap();

    listener.cleanup().await;
}

#[tokio::test]
async fn connect_budget_is_exhausted_after_max_attempts() {
    let policy = ConnectRetryPolicy {
        max_attempts: 3,
        attempt_deadline: Duration::from_millis(50),
        ..ConnectRetryPolicy::default()
    };

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_for_closure = attempts.clone();

    let result: Result<(), ClientError> = connect_with_retry(&policy, move || {
        let attempts = attempts_for_closure.clone();
        async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("connection refused")
        }
    })
    .await;

    assert!(matches!(result, Err(ClientError::ConnectRefused(_))));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

