//! A type-safe request/response messaging layer between a host process and
//! its out-of-process or in-process workers.
//!
//! A [`host_client::HostClient`] spawns a worker through a [`driver::Driver`]
//! (a real OS process over a stream socket, or an in-process task over an
//! in-memory port) and exchanges JSON-framed [`wire::Frame`] records with
//! it: requests flow host-to-worker, `<type>Result`/`<type>Error` responses
//! flow back, keyed by a transaction id that lets many requests be
//! in flight on one connection at once. A [`server::WorkerServer`] handles
//! the worker side, dispatching each request to a registered handler
//! concurrently.

pub mod connection;
pub mod driver;
pub mod error;
pub mod framer;
pub mod host_client;
pub mod middleware;
pub mod policy;
pub mod serializer;
pub mod server;
pub mod startup;
pub mod transport;
pub mod wire;

pub use error::{ClientError, SerializedError, ShutdownReason};
pub use host_client::{HostClient, HostClientConfig, HostClientState};
pub use serializer::{JsonSerializer, Serializer};
pub use wire::Frame;
