//! # Connection State Machine
//!
//! One `Connection` owns a single transport channel for its whole life
//! and cycles it through connect, schedule, write, and await-response
//! states. Every connection belongs to exactly one worker thread and is
//! driven cooperatively from that thread's event loop; nothing here is
//! shared or locked.
//!
//! ## Lifecycle
//!
//! ```text
//! Connecting -> SchedulingWait -> Writing -> WriteRetry* -> AwaitingResponse
//!      ^                ^                                        |
//!      |                +------------- response complete --------+
//!      +--- any transport error / timeout (reconnect), unless stopping -> Closed
//! ```
//!
//! Transport errors are never fatal: they increment the owning thread's
//! counters and force a reconnect of this one connection. The completed
//! request count survives reconnects, so the ideal send schedule keeps
//! marching regardless of how often the transport churns.

use crate::http::{ResponseParser, ResponseSink, ResponseSummary};
use crate::metrics::{ErrorCounters, LatencyKind, LatencyRecorder};
use crate::scheduler::{RateSchedule, SendTiming};
use crate::transport::{Channel, Connector, IoOutcome};
use crate::utils::time_us;
use crate::workload::{ResponseView, Workload};
use mio::{Interest, Registry, Token};
use std::net::SocketAddr;
use tracing::debug;

/// Receive buffer size per connection.
pub const RECVBUF: usize = 8192;

/// Base delay before retrying a failed connect. The worker adds a little
/// random jitter on top so a refused target does not see lock-step
/// retries from every connection at once.
const CONNECT_RETRY_DELAY_US: u64 = 10_000;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Asynchronous connect in flight.
    Connecting,
    /// Waiting for the schedule's next ideal send instant.
    SchedulingWait,
    /// Actively writing the request.
    Writing,
    /// A partial write hit would-block; resume on the next writable event.
    WriteRetry,
    /// Request flushed; reading and parsing the response.
    AwaitingResponse,
    /// Terminal: the run is winding down.
    Closed,
}

/// Everything a connection needs from its worker to make one decision.
///
/// Rebuilt by the worker per dispatch; borrows the thread-local recorder
/// and counters so the connection never owns shared state.
pub struct DriveCtx<'a> {
    pub registry: &'a Registry,
    pub connector: &'a dyn Connector,
    pub workload: &'a dyn Workload,
    pub remote: SocketAddr,
    pub recorder: &'a mut LatencyRecorder,
    pub errors: &'a mut ErrorCounters,
    pub requests: &'a mut u64,
    pub bytes: &'a mut u64,
    pub complete: &'a mut u64,
    pub stop_at: u64,
    /// Samples before this instant are dropped (calibration window).
    pub record_after: u64,
    pub timeout_us: u64,
    pub pipeline: u64,
    pub batch_latency: bool,
    /// Cancellation or deadline observed this poll cycle: stop issuing
    /// new work at the next scheduling decision.
    pub stopping: bool,
    /// Per-cycle random jitter applied to connect retry backoff.
    pub jitter_us: u64,
}

/// Sink that routes parser callbacks into the connection's scratch
/// buffers and completion queue.
struct CaptureSink<'a> {
    capture: bool,
    headers: &'a mut Vec<(Vec<u8>, Vec<u8>)>,
    body: &'a mut Vec<u8>,
    completions: &'a mut Vec<ResponseSummary>,
}

impl ResponseSink for CaptureSink<'_> {
    fn on_status(&mut self, _status: u16) {
        if self.capture {
            self.headers.clear();
            self.body.clear();
        }
    }

    fn on_header(&mut self, name: &[u8], value: &[u8]) {
        if self.capture {
            self.headers.push((name.to_vec(), value.to_vec()));
        }
    }

    fn on_body(&mut self, chunk: &[u8]) {
        if self.capture {
            self.body.extend_from_slice(chunk);
        }
    }

    fn on_message_complete(&mut self, summary: &ResponseSummary) {
        self.completions.push(*summary);
    }
}

pub struct Connection {
    token: Token,
    channel: Option<Box<dyn Channel>>,
    pub state: ConnState,
    schedule: RateSchedule,
    parser: ResponseParser,
    head_request: bool,

    /// Rendered request bytes (the whole pipelined batch). Rendered once
    /// for static workloads, re-rendered per batch for dynamic ones.
    request: Vec<u8>,
    written: usize,
    read_buf: Vec<u8>,

    /// Fully finished request/response cycles on this connection. The
    /// sole driver of the ideal send schedule; monotonically
    /// non-decreasing, survives reconnects.
    pub complete: u64,
    complete_at_last_batch_start: u64,
    pending: u64,
    actual_latency_start: u64,

    /// Next timer instant: a scheduled send or a connect retry.
    due_at: Option<u64>,
    /// Per-request (or connect) deadline.
    timeout_at: Option<u64>,

    // Response-observation scratch, reset per cycle, never reallocated
    // in steady state.
    obs_headers: Vec<(Vec<u8>, Vec<u8>)>,
    obs_body: Vec<u8>,
    completions: Vec<ResponseSummary>,

    // Diagnostic timestamps, not part of the scheduling contract.
    pub latest_connect: u64,
    pub latest_write: u64,
    pub latest_read: u64,
}

impl Connection {
    pub fn new(token: Token, schedule: RateSchedule, head_request: bool) -> Self {
        let mut parser = ResponseParser::new();
        parser.set_head_request(head_request);
        Self {
            token,
            channel: None,
            state: ConnState::Connecting,
            schedule,
            parser,
            head_request,
            request: Vec::new(),
            written: 0,
            read_buf: vec![0u8; RECVBUF],
            complete: 0,
            complete_at_last_batch_start: 0,
            pending: 0,
            actual_latency_start: 0,
            due_at: None,
            timeout_at: None,
            obs_headers: Vec::new(),
            obs_body: Vec::new(),
            completions: Vec::new(),
            latest_connect: 0,
            latest_write: 0,
            latest_read: 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Whether the connection was keeping pace with its ideal schedule
    /// the last time it consulted the scheduler.
    pub fn caught_up(&self) -> bool {
        self.schedule.caught_up()
    }

    /// Earliest instant at which this connection needs the event loop to
    /// wake up for it (scheduled send, retry, or timeout).
    pub fn next_due(&self) -> Option<u64> {
        match (self.due_at, self.timeout_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Begin (or retry) an asynchronous connect.
    pub fn open(&mut self, ctx: &mut DriveCtx<'_>) {
        if ctx.stopping {
            self.close(ctx);
            return;
        }
        let now = time_us();
        match ctx.connector.connect(None, ctx.remote) {
            Ok(mut channel) => {
                let interest = Interest::READABLE | Interest::WRITABLE;
                if let Err(e) = channel.register(ctx.registry, self.token, interest) {
                    debug!("connection {}: register failed: {}", self.token.0, e);
                    ctx.errors.connect += 1;
                    self.schedule_connect_retry(ctx, now);
                    return;
                }
                self.channel = Some(channel);
                self.state = ConnState::Connecting;
                self.due_at = None;
                self.timeout_at = Some(now + ctx.timeout_us);
            }
            Err(e) => {
                debug!("connection {}: connect failed: {}", self.token.0, e);
                ctx.errors.connect += 1;
                self.schedule_connect_retry(ctx, now);
            }
        }
    }

    fn schedule_connect_retry(&mut self, ctx: &mut DriveCtx<'_>, now: u64) {
        self.channel = None;
        self.state = ConnState::Connecting;
        self.timeout_at = None;
        self.due_at = Some(now + CONNECT_RETRY_DELAY_US + ctx.jitter_us);
    }

    /// Readiness dispatch from the event loop.
    pub fn on_event(&mut self, ctx: &mut DriveCtx<'_>, readable: bool, writable: bool) {
        if writable {
            match self.state {
                ConnState::Connecting => self.check_connect(ctx),
                ConnState::WriteRetry => self.continue_write(ctx),
                _ => {}
            }
        }
        if readable && self.state == ConnState::AwaitingResponse {
            self.on_readable(ctx);
        }
    }

    /// Timer dispatch: scheduled sends, connect retries, timeouts.
    pub fn drive_timers(&mut self, ctx: &mut DriveCtx<'_>, now: u64) {
        match self.state {
            ConnState::Connecting => {
                if self.channel.is_none() {
                    if self.due_at.map_or(false, |d| now >= d) {
                        self.due_at = None;
                        self.open(ctx);
                    }
                } else if self.timeout_at.map_or(false, |t| now >= t) {
                    debug!("connection {}: connect timed out", self.token.0);
                    ctx.errors.connect += 1;
                    self.reconnect(ctx);
                }
            }
            ConnState::SchedulingWait => {
                if self.due_at.map_or(false, |d| now >= d) {
                    self.due_at = None;
                    self.start_write(ctx);
                }
            }
            ConnState::AwaitingResponse | ConnState::Writing | ConnState::WriteRetry => {
                if self.timeout_at.map_or(false, |t| now >= t) {
                    debug!("connection {}: request timed out", self.token.0);
                    ctx.errors.timeout += 1;
                    self.reconnect(ctx);
                }
            }
            _ => {}
        }
    }

    /// Resolve the in-flight connect after a writable event.
    fn check_connect(&mut self, ctx: &mut DriveCtx<'_>) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        match channel.connect_ready() {
            Ok(true) => {
                self.latest_connect = time_us();
                self.timeout_at = None;
                self.enter_scheduling(ctx);
            }
            Ok(false) => {}
            Err(e) => {
                debug!("connection {}: connect failed: {}", self.token.0, e);
                ctx.errors.connect += 1;
                let now = time_us();
                self.drop_channel(ctx);
                if ctx.stopping {
                    self.state = ConnState::Closed;
                } else {
                    self.schedule_connect_retry(ctx, now);
                }
            }
        }
    }

    /// Ask the scheduler when the next request may go out, then either
    /// send it, arm a timer for the ideal instant, or wind down if the
    /// run is ending.
    fn enter_scheduling(&mut self, ctx: &mut DriveCtx<'_>) {
        let now = time_us();
        if ctx.stopping || now >= ctx.stop_at {
            self.close(ctx);
            return;
        }
        match self.schedule.next_send(self.complete, now) {
            SendTiming::Immediate => self.start_write(ctx),
            SendTiming::Delay(delay) => {
                let due = now + delay;
                if due >= ctx.stop_at {
                    // The next ideal send falls past the deadline; no
                    // further requests belong to this run.
                    self.close(ctx);
                } else {
                    self.state = ConnState::SchedulingWait;
                    self.due_at = Some(due);
                }
            }
        }
    }

    /// Render the request batch if needed and begin writing it.
    fn start_write(&mut self, ctx: &mut DriveCtx<'_>) {
        if ctx.stopping {
            self.close(ctx);
            return;
        }
        if self.request.is_empty() || ctx.workload.is_dynamic() {
            self.request.clear();
            for _ in 0..ctx.pipeline {
                self.request.extend_from_slice(&ctx.workload.build_request());
            }
        }
        self.written = 0;
        self.complete_at_last_batch_start = self.complete;
        self.state = ConnState::Writing;
        // Covers a peer that accepts the connection but never drains the
        // request; refreshed once the write flushes.
        self.timeout_at = Some(time_us() + ctx.timeout_us);
        self.continue_write(ctx);
    }

    /// Push request bytes until flushed or would-block.
    fn continue_write(&mut self, ctx: &mut DriveCtx<'_>) {
        loop {
            let Some(channel) = self.channel.as_mut() else {
                return;
            };
            match channel.write(&self.request[self.written..]) {
                Ok(IoOutcome::Done(n)) => {
                    self.written += n;
                    if self.written == self.request.len() {
                        let now = time_us();
                        self.written = 0;
                        self.actual_latency_start = now;
                        self.latest_write = now;
                        self.pending = ctx.pipeline;
                        *ctx.requests += ctx.pipeline;
                        self.state = ConnState::AwaitingResponse;
                        self.timeout_at = Some(now + ctx.timeout_us);
                        // Bytes queued from an earlier burst would not
                        // raise a fresh readability edge; drain them now
                        // if the channel hints data is waiting.
                        if self.channel.as_ref().map_or(false, |c| c.readable()) {
                            self.on_readable(ctx);
                        }
                        return;
                    }
                }
                Ok(IoOutcome::Retry) => {
                    self.state = ConnState::WriteRetry;
                    return;
                }
                Ok(IoOutcome::Closed) | Err(_) => {
                    debug!("connection {}: write failed", self.token.0);
                    ctx.errors.write += 1;
                    self.reconnect(ctx);
                    return;
                }
            }
        }
    }

    /// Drain the socket and feed the parser until would-block.
    fn on_readable(&mut self, ctx: &mut DriveCtx<'_>) {
        loop {
            if self.state == ConnState::Closed || self.state == ConnState::Connecting {
                return;
            }
            let Some(channel) = self.channel.as_mut() else {
                return;
            };
            match channel.read(&mut self.read_buf) {
                Ok(IoOutcome::Done(n)) => {
                    *ctx.bytes += n as u64;
                    self.latest_read = time_us();
                    let mut sink = CaptureSink {
                        capture: ctx.workload.wants_response(),
                        headers: &mut self.obs_headers,
                        body: &mut self.obs_body,
                        completions: &mut self.completions,
                    };
                    if let Err(e) = self.parser.feed(&self.read_buf[..n], &mut sink) {
                        debug!("connection {}: parse error: {}", self.token.0, e);
                        ctx.errors.read += 1;
                        self.reconnect(ctx);
                        return;
                    }
                    if self.flush_completions(ctx) {
                        return;
                    }
                }
                Ok(IoOutcome::Retry) => return,
                Ok(IoOutcome::Closed) => {
                    // Peer closed: an until-close body completes here; a
                    // close between messages is a keep-alive refusal;
                    // anything else is a truncated read.
                    let mut sink = CaptureSink {
                        capture: ctx.workload.wants_response(),
                        headers: &mut self.obs_headers,
                        body: &mut self.obs_body,
                        completions: &mut self.completions,
                    };
                    match self.parser.finish(&mut sink) {
                        Ok(()) => {
                            if self.flush_completions(ctx) {
                                return;
                            }
                        }
                        Err(e) => {
                            debug!("connection {}: {}", self.token.0, e);
                            ctx.errors.read += 1;
                        }
                    }
                    self.reconnect(ctx);
                    return;
                }
                Err(e) => {
                    debug!("connection {}: read failed: {}", self.token.0, e);
                    ctx.errors.read += 1;
                    self.reconnect(ctx);
                    return;
                }
            }
        }
    }

    /// Process queued parser completions. Returns true when the channel
    /// was replaced (stop using the current read loop).
    fn flush_completions(&mut self, ctx: &mut DriveCtx<'_>) -> bool {
        let mut done = std::mem::take(&mut self.completions);
        let mut reset = false;
        for summary in done.drain(..) {
            if !self.process_response(ctx, &summary) {
                reset = true;
                break;
            }
        }
        done.clear();
        self.completions = done;
        if reset {
            self.reconnect(ctx);
        }
        reset
    }

    /// Account one finished response: error classification, latency
    /// recording, workload observation, schedule advance.
    ///
    /// Returns false when the connection must be torn down (the peer is
    /// closing after this response).
    fn process_response(&mut self, ctx: &mut DriveCtx<'_>, summary: &ResponseSummary) -> bool {
        let now = time_us();

        if !(200..400).contains(&summary.status) {
            ctx.errors.status += 1;
        }

        if now >= ctx.record_after {
            // In batch-latency mode only the final response of a
            // pipelined batch is measured, against the batch's first
            // ideal send time; otherwise every response is measured
            // against its own slot in the schedule.
            let record_this = !ctx.batch_latency || self.pending == 1;
            if record_this {
                let index = if ctx.batch_latency {
                    self.complete_at_last_batch_start
                } else {
                    self.complete
                };
                let expected_start = self.schedule.ideal_send_time(index);
                ctx.recorder
                    .record(LatencyKind::Corrected, now.saturating_sub(expected_start));
                ctx.recorder.record(
                    LatencyKind::Uncorrected,
                    now.saturating_sub(self.actual_latency_start),
                );
            }
        }

        if ctx.workload.wants_response() {
            ctx.workload.observe_response(&ResponseView {
                status: summary.status,
                headers: &self.obs_headers,
                body: &self.obs_body,
            });
        }

        self.complete += 1;
        *ctx.complete += 1;
        self.pending = self.pending.saturating_sub(1);

        if !summary.keep_alive {
            return false;
        }
        if self.pending == 0 {
            self.timeout_at = None;
            self.enter_scheduling(ctx);
        }
        true
    }

    /// Tear down the channel and connect again, unless the run is
    /// winding down. The schedule and completed count carry over.
    fn reconnect(&mut self, ctx: &mut DriveCtx<'_>) {
        self.drop_channel(ctx);
        self.parser = ResponseParser::new();
        self.parser.set_head_request(self.head_request);
        self.written = 0;
        self.pending = 0;
        self.due_at = None;
        self.timeout_at = None;
        self.obs_headers.clear();
        self.obs_body.clear();
        self.completions.clear();
        if ctx.stopping {
            self.state = ConnState::Closed;
        } else {
            self.open(ctx);
        }
    }

    /// Terminal close: deregister and drop the channel.
    fn close(&mut self, ctx: &mut DriveCtx<'_>) {
        self.drop_channel(ctx);
        self.state = ConnState::Closed;
        self.due_at = None;
        self.timeout_at = None;
    }

    fn drop_channel(&mut self, ctx: &mut DriveCtx<'_>) {
        if let Some(mut channel) = self.channel.take() {
            let _ = channel.deregister(ctx.registry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::RateSchedule;

    #[test]
    fn test_new_connection_defaults() {
        let conn = Connection::new(Token(7), RateSchedule::new(0, 100.0), false);
        assert_eq!(conn.state, ConnState::Connecting);
        assert_eq!(conn.complete, 0);
        assert!(conn.caught_up());
        assert!(conn.next_due().is_none());
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_next_due_picks_earliest() {
        let mut conn = Connection::new(Token(0), RateSchedule::new(0, 100.0), false);
        conn.due_at = Some(500);
        conn.timeout_at = Some(300);
        assert_eq!(conn.next_due(), Some(300));
        conn.timeout_at = Some(900);
        assert_eq!(conn.next_due(), Some(500));
        conn.due_at = None;
        assert_eq!(conn.next_due(), Some(900));
    }
}
