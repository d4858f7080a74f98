//! Startup data: the small JSON record passed from host to worker at spawn
//! time.

use serde::{Deserialize, Serialize};

/// Legacy environment variable carrying the full startup-data JSON blob.
pub const ENV_STARTUP_DATA: &str = "ISOLATED_WORKERS_STARTUP_DATA";
/// Legacy fallback: the socket path alone.
pub const ENV_SOCKET_PATH: &str = "ISOLATED_WORKERS_SOCKET_PATH";
/// Legacy fallback: the server-connect timeout alone, in milliseconds.
pub const ENV_SERVER_CONNECT_TIMEOUT: &str = "ISOLATED_WORKERS_SERVER_CONNECT_TIMEOUT";

/// Which driver spawned this worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    ChildProcess,
    WorkerThreads,
}

impl DriverKind {
    pub fn wire_name(&self) -> &'static str {
        match self {
            DriverKind::ChildProcess => "child_process",
            DriverKind::WorkerThreads => "worker_threads",
        }
    }
}

/// The JSON record a worker reads to locate its transport and agree on the
/// serializer. Field names follow the wire format exactly:
/// `driver`, `socketPath`, `serializer`, `serverConnectTimeout` (integer
/// milliseconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupData {
    pub driver: DriverKind,
    /// Present for the process driver only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,
    pub serializer: String,
    #[serde(rename = "serverConnectTimeout")]
    pub server_connect_timeout_ms: u64,
}

impl StartupData {
    pub fn to_env_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Read startup data from the environment, preferring
    /// [`ENV_STARTUP_DATA`] and falling back to the legacy individual
    /// variables for backward compatibility.
    pub fn from_env() -> Option<Self> {
        if let Ok(json) = std::env::var(ENV_STARTUP_DATA) {
            if let Ok(data) = serde_json::from_str(&json) {
                return Some(data);
            }
            tracing::warn!("failed to parse {ENV_STARTUP_DATA}, falling back to legacy vars");
        }

        let socket_path = std::env::var(ENV_SOCKET_PATH).ok()?;
        let timeout_ms = std::env::var(ENV_SERVER_CONNECT_TIMEOUT)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30_000);
        Some(StartupData {
            driver: DriverKind::ChildProcess,
            socket_path: Some(socket_path),
            serializer: "json".to_string(),
            server_connect_timeout_ms: timeout_ms,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_format_uses_documented_field_names() {
        let data = StartupData {
            driver: DriverKind::ChildProcess,
            socket_path: Some("/tmp/worker-x.sock".to_string()),
            serializer: "json".to_string(),
            server_connect_timeout_ms: 30_000,
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["driver"], "child_process");
        assert_eq!(json["socketPath"], "/tmp/worker-x.sock");
        assert_eq!(json["serializer"], "json");
        assert_eq!(json["serverConnectTimeout"], 30_000);
    }
}
