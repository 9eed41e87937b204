//! # Worker Thread Harness
//!
//! One worker thread owns one `mio::Poll` event loop, a fixed slice of
//! connections, its own histogram pair and error counters, and runs
//! until the shared deadline or cancellation. There is no intra-thread
//! parallelism and no locking: the only cross-thread state a worker
//! touches is the immutable configuration snapshot it was spawned with,
//! the shared workload/connector (read-only), and the cancellation
//! token (read-only).
//!
//! The loop blocks only inside `Poll::poll`; every transport and parser
//! operation dispatched from it is non-blocking. The poll timeout is the
//! earliest of any connection's scheduled send or timeout deadline,
//! capped at the ~100 ms housekeeping tick that enforces request
//! timeouts and the run deadline.

use crate::connection::{Connection, DriveCtx};
use crate::metrics::{ErrorCounters, LatencyRecorder};
use crate::runner::CancelToken;
use crate::scheduler::RateSchedule;
use crate::transport::Connector;
use crate::utils::time_us;
use crate::workload::{ThreadContext, Workload};
use anyhow::{Context, Result};
use mio::{Events, Poll, Token};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Housekeeping tick: the ceiling on how long the loop sleeps between
/// timeout/deadline checks.
const TICK_INTERVAL_US: u64 = 100_000;

/// Calibration window applied when `record_all_responses` is off:
/// samples completed inside the window are dropped.
const CALIBRATE_DELAY_US: u64 = 10_000_000;

/// Immutable per-thread configuration snapshot, moved into the thread at
/// spawn.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub id: usize,
    /// Connections this thread owns exclusively.
    pub connections: u64,
    /// This thread's share of the total target rate, requests/sec.
    pub rate: f64,
    pub duration_us: u64,
    pub timeout_us: u64,
    pub pipeline: u64,
    pub batch_latency: bool,
    pub record_corrected: bool,
    pub record_uncorrected: bool,
    pub record_all_responses: bool,
    pub remote: SocketAddr,
    /// Pin the thread to this core when set.
    pub pin_cpu: Option<usize>,
    /// Operator-supplied workload arguments (everything after the URL).
    pub workload_args: Vec<String>,
}

/// Everything a worker hands back to the coordinator at join.
pub struct WorkerOutput {
    pub id: usize,
    pub recorder: LatencyRecorder,
    pub errors: ErrorCounters,
    pub complete: u64,
    pub requests: u64,
    pub bytes: u64,
    pub start_us: u64,
    pub end_us: u64,
}

/// Run one worker to completion. Called on a dedicated OS thread.
pub fn run_worker(
    cfg: WorkerConfig,
    connector: Arc<dyn Connector>,
    workload: Arc<dyn Workload>,
    cancel: CancelToken,
) -> Result<WorkerOutput> {
    if let Some(core) = cfg.pin_cpu {
        let pinned = core_affinity::set_for_current(core_affinity::CoreId { id: core });
        if !pinned {
            debug!("worker {}: failed to pin to core {}", cfg.id, core);
        }
    }

    let thread_ctx = ThreadContext {
        thread_id: cfg.id,
        connections: cfg.connections,
        requests_per_sec: cfg.rate,
    };
    workload.setup(&thread_ctx);
    workload.init(&thread_ctx, &cfg.workload_args);

    let mut poll = Poll::new().context("failed to create event poller")?;
    let mut events = Events::with_capacity(1024);
    let mut rng = SmallRng::from_entropy();

    let mut recorder = LatencyRecorder::new(cfg.record_corrected, cfg.record_uncorrected)?;
    let mut errors = ErrorCounters::new();
    let mut requests = 0u64;
    let mut bytes = 0u64;
    let mut complete = 0u64;

    let thread_start = time_us();
    let stop_at = thread_start + cfg.duration_us;
    let record_after = if cfg.record_all_responses {
        thread_start
    } else {
        thread_start + CALIBRATE_DELAY_US
    };
    let conn_rate = cfg.rate / cfg.connections.max(1) as f64;

    debug!(
        "worker {}: {} connections at {:.2} req/s each",
        cfg.id, cfg.connections, conn_rate
    );

    let mut connections: Vec<Connection> = (0..cfg.connections as usize)
        .map(|i| {
            Connection::new(
                Token(i),
                RateSchedule::new(thread_start, conn_rate),
                workload.is_head(),
            )
        })
        .collect();

    // Open everything up front; failures schedule their own retries.
    {
        let registry = poll.registry();
        let mut ctx = DriveCtx {
            registry,
            connector: connector.as_ref(),
            workload: workload.as_ref(),
            remote: cfg.remote,
            recorder: &mut recorder,
            errors: &mut errors,
            requests: &mut requests,
            bytes: &mut bytes,
            complete: &mut complete,
            stop_at,
            record_after,
            timeout_us: cfg.timeout_us,
            pipeline: cfg.pipeline,
            batch_latency: cfg.batch_latency,
            stopping: false,
            jitter_us: rng.gen_range(0..5_000),
        };
        for conn in connections.iter_mut() {
            conn.open(&mut ctx);
        }
    }

    loop {
        let now = time_us();
        if cancel.is_cancelled() || now >= stop_at {
            // Stop issuing new work; in-flight responses are abandoned
            // at thread exit, which the deadline semantics permit.
            break;
        }
        if connections.iter().all(|c| c.is_closed()) {
            break;
        }

        let mut wake_at = now + TICK_INTERVAL_US;
        for conn in &connections {
            if let Some(due) = conn.next_due() {
                wake_at = wake_at.min(due);
            }
        }
        let poll_timeout = Duration::from_micros(wake_at.saturating_sub(now));

        match poll.poll(&mut events, Some(poll_timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("event poll failed"),
        }

        let now = time_us();
        let stopping = cancel.is_cancelled() || now >= stop_at;
        let registry = poll.registry();
        let mut ctx = DriveCtx {
            registry,
            connector: connector.as_ref(),
            workload: workload.as_ref(),
            remote: cfg.remote,
            recorder: &mut recorder,
            errors: &mut errors,
            requests: &mut requests,
            bytes: &mut bytes,
            complete: &mut complete,
            stop_at,
            record_after,
            timeout_us: cfg.timeout_us,
            pipeline: cfg.pipeline,
            batch_latency: cfg.batch_latency,
            stopping,
            jitter_us: rng.gen_range(0..5_000),
        };

        for event in events.iter() {
            let idx = event.token().0;
            if let Some(conn) = connections.get_mut(idx) {
                conn.on_event(&mut ctx, event.is_readable(), event.is_writable());
            }
        }

        let now = time_us();
        for conn in connections.iter_mut() {
            conn.drive_timers(&mut ctx, now);
        }
    }

    let end_us = time_us();
    for (idx, conn) in connections.iter().enumerate() {
        debug!(
            "worker {} connection {}: complete={} caught_up={} last connect/write/read = {}/{}/{}",
            cfg.id,
            idx,
            conn.complete,
            conn.caught_up(),
            conn.latest_connect,
            conn.latest_write,
            conn.latest_read,
        );
    }
    debug!(
        "worker {}: {} complete, {} requests, {} bytes, errors: {:?}",
        cfg.id, complete, requests, bytes, errors
    );

    Ok(WorkerOutput {
        id: cfg.id,
        recorder,
        errors,
        complete,
        requests,
        bytes,
        start_us: thread_start,
        end_us,
    })
}
