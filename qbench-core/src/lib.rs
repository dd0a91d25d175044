//! # qbench
//!
//! Throughput and echo harness for QUIC. A client opens many streams on one
//! session and drives them concurrently against a server that echoes every
//! byte back; the bytes moved are aggregated in [`Stats`].
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
pub use anyhow;
pub use credential;
pub use quinn;
pub use tokio;
pub use tokio_util;
pub use tracing;

pub use crate::client::Client;
pub use crate::error::{Error, Scope};
pub use crate::server::Server;
pub use crate::stats::{Snapshot, Stats};

pub mod client;
pub mod config;
pub mod env;
pub mod error;
pub mod metrics;
pub mod report;
pub mod server;
pub mod stats;
pub mod transport;
pub mod worker;
