//! # Run Coordinator Module
//!
//! The coordinator turns one immutable [`RunConfig`] into a fleet of
//! worker threads, waits for them to finish, and folds their histograms
//! and counters into a single [`RunSummary`]. Configuration flows down
//! at start (coordinator to threads to connections) and measurements
//! flow back up at join; no worker ever touches another worker's state
//! while running.
//!
//! ## Cancellation
//!
//! Workers observe a shared [`CancelToken`] at defined poll points. The
//! token is set by whoever owns process signal wiring (the binary
//! installs a Ctrl-C handler); eventual visibility is all that is
//! required, since a late observation only delays wind-down, never
//! corrupts recorded samples.

use crate::metrics::{ErrorCounters, LatencyRecorder};
use crate::transport::Connector;
use crate::utils::{partition_evenly, validate_connections, validate_pipeline, validate_rate};
use crate::worker::{run_worker, WorkerConfig, WorkerOutput};
use crate::workload::{resolve_target, Workload};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Cooperative cancellation handle shared by the coordinator and every
/// worker. Cloning is cheap; all clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request wind-down. Relaxed ordering suffices: workers only need
    /// eventual visibility.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Immutable configuration for one load-generation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Worker thread count (each runs its own event loop).
    pub threads: u64,
    /// Total connections, spread across threads; the remainder of the
    /// even split goes to thread 0.
    pub connections: u64,
    /// Total target throughput in requests/sec, divided evenly per
    /// thread and then per connection.
    pub rate: u64,
    pub duration: Duration,
    /// Per-request (and per-connect) timeout.
    pub timeout: Duration,
    /// Requests written back-to-back per send on each connection.
    pub pipeline: u64,
    /// Measure pipelined batches as a whole instead of per request.
    pub batch_latency: bool,
    pub record_corrected_latency: bool,
    pub record_uncorrected_latency: bool,
    /// When false, samples inside the initial calibration window are
    /// dropped.
    pub record_all_responses: bool,
    /// Pin worker threads to distinct cores.
    pub pin_cpus: bool,
    pub host: String,
    pub port: u16,
}

impl RunConfig {
    /// Create a run configuration from parsed CLI arguments.
    ///
    /// This is where user-facing units (durations, SI-suffixed counts,
    /// a URL) become the internal configuration the coordinator
    /// partitions across threads. Validation failures here are fatal
    /// startup errors.
    pub fn from_args(args: &crate::cli::Args) -> Result<Self> {
        let target = crate::cli::parse_url(&args.url)?;
        let config = Self {
            threads: args.threads,
            connections: args.connections,
            rate: args.rate,
            duration: args.duration,
            timeout: args.timeout,
            pipeline: args.pipeline,
            batch_latency: args.batch_latency,
            record_corrected_latency: true,
            record_uncorrected_latency: true,
            record_all_responses: args.record_all_responses,
            pin_cpus: args.pin_cpus,
            host: target.host,
            port: target.port,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants every component downstream relies on.
    pub fn validate(&self) -> Result<()> {
        validate_rate(self.rate)?;
        validate_connections(self.connections, self.threads)?;
        validate_pipeline(self.pipeline)?;
        if self.duration.is_zero() {
            anyhow::bail!("Duration cannot be zero");
        }
        if self.timeout.is_zero() {
            anyhow::bail!("Timeout cannot be zero");
        }
        Ok(())
    }
}

/// Merged result of a whole run.
pub struct RunSummary {
    pub complete: u64,
    pub requests: u64,
    pub bytes: u64,
    /// Wall time from the first worker starting to the last finishing,
    /// in microseconds.
    pub duration_us: u64,
    pub recorder: LatencyRecorder,
    pub errors: ErrorCounters,
}

impl RunSummary {
    pub fn requests_per_sec(&self) -> f64 {
        if self.duration_us == 0 {
            return 0.0;
        }
        self.complete as f64 / (self.duration_us as f64 / 1_000_000.0)
    }

    pub fn bytes_per_sec(&self) -> f64 {
        if self.duration_us == 0 {
            return 0.0;
        }
        self.bytes as f64 / (self.duration_us as f64 / 1_000_000.0)
    }
}

/// Partitions the configuration, runs the workers, merges their output.
pub struct Coordinator {
    config: RunConfig,
    connector: Arc<dyn Connector>,
    workload: Arc<dyn Workload>,
    workload_args: Vec<String>,
}

impl Coordinator {
    pub fn new(
        config: RunConfig,
        connector: Arc<dyn Connector>,
        workload: Arc<dyn Workload>,
        workload_args: Vec<String>,
    ) -> Self {
        Self {
            config,
            connector,
            workload,
            workload_args,
        }
    }

    /// Execute the run to completion (deadline or cancellation).
    ///
    /// Only startup problems — invalid configuration, an unresolvable
    /// target — return an error here; everything that goes wrong after
    /// the workers start is absorbed into their counters.
    pub fn run(&self, cancel: CancelToken) -> Result<RunSummary> {
        self.config.validate()?;

        let remote = resolve_target(
            self.workload.as_ref(),
            &self.config.host,
            self.config.port,
        )
        .context("failed to resolve target address")?;
        info!(
            "Target {}:{} resolved to {} ({} transport)",
            self.config.host,
            self.config.port,
            remote,
            self.connector.name()
        );

        let configs = self.build_worker_configs(remote);

        let mut handles = Vec::with_capacity(configs.len());
        for cfg in configs {
            let connector = Arc::clone(&self.connector);
            let workload = Arc::clone(&self.workload);
            let cancel = cancel.clone();
            let name = format!("worker-{}", cfg.id);
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || run_worker(cfg, connector, workload, cancel))
                .context("failed to spawn worker thread")?;
            handles.push(handle);
        }

        let mut outputs: Vec<WorkerOutput> = Vec::with_capacity(handles.len());
        for handle in handles {
            let output = handle
                .join()
                .map_err(|_| anyhow::anyhow!("worker thread panicked"))??;
            outputs.push(output);
        }

        self.merge(outputs)
    }

    /// Build one immutable config snapshot per worker thread.
    ///
    /// Connections split evenly with the remainder on thread 0; the
    /// rate splits evenly across threads regardless of the connection
    /// remainder, matching the contract that throughput is divided per
    /// thread and then per connection.
    fn build_worker_configs(&self, remote: SocketAddr) -> Vec<WorkerConfig> {
        let cfg = &self.config;
        let parts = partition_evenly(cfg.connections, cfg.threads as usize);
        let per_thread_rate = cfg.rate as f64 / cfg.threads as f64;

        let cores = if cfg.pin_cpus {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        parts
            .iter()
            .enumerate()
            .map(|(id, &connections)| WorkerConfig {
                id,
                connections,
                rate: per_thread_rate,
                duration_us: cfg.duration.as_micros() as u64,
                timeout_us: cfg.timeout.as_micros() as u64,
                pipeline: cfg.pipeline,
                batch_latency: cfg.batch_latency,
                record_corrected: cfg.record_corrected_latency,
                record_uncorrected: cfg.record_uncorrected_latency,
                record_all_responses: cfg.record_all_responses,
                remote,
                pin_cpu: cores.get(id % cores.len().max(1)).map(|c| c.id),
                workload_args: self.workload_args.clone(),
            })
            .collect()
    }

    /// Fold per-thread output into the run summary. Histograms union
    /// bucket-wise; counters sum.
    fn merge(&self, outputs: Vec<WorkerOutput>) -> Result<RunSummary> {
        let mut recorder = LatencyRecorder::new(
            self.config.record_corrected_latency,
            self.config.record_uncorrected_latency,
        )?;
        let mut errors = ErrorCounters::new();
        let mut complete = 0u64;
        let mut requests = 0u64;
        let mut bytes = 0u64;
        let mut earliest_start = u64::MAX;
        let mut latest_end = 0u64;

        for output in &outputs {
            recorder.merge(&output.recorder)?;
            errors.merge(&output.errors);
            complete += output.complete;
            requests += output.requests;
            bytes += output.bytes;
            earliest_start = earliest_start.min(output.start_us);
            latest_end = latest_end.max(output.end_us);
            debug!(
                "worker {} merged: complete={} errors={:?}",
                output.id, output.complete, output.errors
            );
        }

        let duration_us = latest_end.saturating_sub(earliest_start.min(latest_end));

        Ok(RunSummary {
            complete,
            requests,
            bytes,
            duration_us,
            recorder,
            errors,
        })
    }
}
