//! # Harbor Server
//!
//! The FileHarbor server: accepts mutually authenticated TLS connections,
//! binds each authenticated client to one library, and serves the framed
//! file-transfer protocol with locking, rate limiting, resumable uploads,
//! and idle reaping.
//!
//! Module layout mirrors the per-connection pipeline:
//!
//! - [`config`]: the validated configuration document everything reads
//! - [`tls`]: rustls server config requiring client certificates
//! - [`auth`]: certificate fingerprint -> client record resolution + CRL
//! - [`library`]: the immutable library set and per-library policy
//! - [`limiter`]: per-library token-bucket byte budgets
//! - [`registry`]: live sessions, the lock table, the idle reaper
//! - [`connection`]: the per-connection state machine
//! - [`runtime`]: acceptor loop, worker spawning, graceful shutdown
//!
//! Configuration, CA, and CRL are immutable after startup; the session
//! registry (with its lock table and rate buckets) is the only shared
//! mutable state.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod library;
pub mod limiter;
pub mod registry;
pub mod runtime;
pub mod tls;

pub use config::ServerConfig;
pub use error::ServerError;
pub use runtime::Server;

/// Session identifier, unique per server lifetime
pub type SessionId = u64;
