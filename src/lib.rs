//! # HTTP Loadgen Library
//!
//! An open-loop, constant-throughput HTTP load generator. The library
//! drives a target service at a precisely controlled request rate from
//! many non-blocking connections spread over worker threads, and reports
//! response latency corrected for coordinated omission: the measurement
//! bias where a closed-loop tester only times the requests it actually
//! managed to send, hiding the delay that its own backpressure imposed
//! on the ones it did not.
//!
//! ## Architecture Overview
//!
//! The library is organized into several key modules:
//!
//! - `runner`: run configuration and the coordinator that partitions it
//!   across threads, joins them, and merges their measurements
//! - `worker`: one event loop per worker thread, built on readiness
//!   polling; hosts that thread's connections, histograms and counters
//! - `connection`: the per-connection state machine (connect, schedule,
//!   write, await response, reconnect)
//! - `scheduler`: the ideal send schedule and catch-up handling that
//!   make the generator open-loop
//! - `metrics`: dual HDR-histogram latency recording (corrected and
//!   uncorrected) and per-thread error counters
//! - `http`: incremental HTTP/1.1 response parsing fed straight from
//!   socket reads
//! - `transport`: the pluggable byte-stream channel seam (plain TCP
//!   provided; a TLS or user-space backend plugs in behind the traits)
//! - `workload`: the request-generation strategy seam with a static
//!   default
//! - `cli` / `results`: argument parsing and report assembly
//!
//! ## Measurement Model
//!
//! Every connection is assigned an independent ideal schedule: request
//! `k` should leave at `thread_start + k / rate`. Two latency series are
//! recorded per completion:
//!
//! - **corrected** = completion time minus the *ideal* send time — what
//!   a client that kept to the schedule would have experienced;
//! - **uncorrected** = completion time minus the *actual* send time —
//!   what a naive tester reports.
//!
//! Under overload the two diverge, and the corrected series is the one
//! that tells the truth about the target.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use http_loadgen::runner::{CancelToken, Coordinator, RunConfig};
//! use http_loadgen::transport::TcpConnector;
//! use http_loadgen::workload::StaticWorkload;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = RunConfig {
//!         threads: 2,
//!         connections: 10,
//!         rate: 1000,
//!         duration: Duration::from_secs(10),
//!         timeout: Duration::from_millis(500),
//!         pipeline: 1,
//!         batch_latency: false,
//!         record_corrected_latency: true,
//!         record_uncorrected_latency: true,
//!         record_all_responses: true,
//!         pin_cpus: false,
//!         host: "127.0.0.1".to_string(),
//!         port: 8080,
//!     };
//!     let workload = StaticWorkload::new("GET", "/", "127.0.0.1:8080", &[], None);
//!     let coordinator = Coordinator::new(
//!         config,
//!         Arc::new(TcpConnector::new()),
//!         Arc::new(workload),
//!         Vec::new(),
//!     );
//!     let summary = coordinator.run(CancelToken::new())?;
//!     println!("{:.2} req/s", summary.requests_per_sec());
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod connection;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod results;
pub mod runner;
pub mod scheduler;
pub mod transport;
pub mod utils;
pub mod worker;
pub mod workload;

// Re-export the types most library users need.

/// Run configuration and execution.
pub use runner::{CancelToken, Coordinator, RunConfig, RunSummary};

/// Measurement types.
pub use metrics::{ErrorCounters, LatencyKind, LatencyRecorder};

/// Extension seams.
pub use transport::{Channel, Connector, TcpConnector};
pub use workload::{StaticWorkload, Workload};

/// Report assembly.
pub use results::Report;

/// The current version of the load generator.
///
/// Populated from Cargo.toml and recorded in report metadata for
/// reproducibility.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values.
pub mod defaults {
    /// Default worker thread count.
    ///
    /// Two threads keep the tool honest on small machines while still
    /// exercising the multi-thread merge path; heavier runs should set
    /// `-t` explicitly.
    pub const THREADS: u64 = 2;

    /// Default number of connections to keep open.
    pub const CONNECTIONS: u64 = 10;

    /// Default pipeline depth (no pipelining).
    pub const PIPELINE: u64 = 1;
}
