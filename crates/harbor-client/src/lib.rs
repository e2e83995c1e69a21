//! # Harbor Client
//!
//! The FileHarbor client: brings up a mutually authenticated TLS connection,
//! handshakes into a library, and drives uploads and downloads with resume,
//! retry, and progress reporting.
//!
//! One engine, two fronts: [`HarborClient`] is the async engine;
//! [`blocking::Client`] wraps it over an owned current-thread runtime for
//! synchronous callers. Correctness contracts are identical.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod blocking;
pub mod config;
pub mod connection;
pub mod error;
pub mod progress;
pub mod retry;
pub mod transfer;

pub use config::ClientConfig;
pub use connection::Connection;
pub use error::ClientError;
pub use progress::{Operation, ProgressEvent};
pub use retry::RetryPolicy;
pub use transfer::{HarborClient, TransferOutcome};
