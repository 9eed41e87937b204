//! Per-connection rate scheduling.
//!
//! Each connection runs on an independent ideal send schedule derived
//! only from elapsed wall time and its completed-request count, never
//! from when responses actually arrived. That decoupling is what makes
//! the generator open-loop: a slow server delays responses, not the
//! schedule, and the gap between the two is reported as corrected
//! latency instead of silently disappearing.

/// How long catch-up mode outpaces the configured rate.
///
/// A connection that has fallen behind its schedule sends at twice its
/// normal rate until the completed count reaches what the ideal schedule
/// mandates at the current wall time.
const CATCH_UP_FACTOR: f64 = 2.0;

/// Decision for when the next request may be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendTiming {
    /// Write immediately; the schedule is already due (or overdue).
    Immediate,
    /// Wait this many microseconds before writing.
    Delay(u64),
}

/// The ideal-schedule state for one connection.
///
/// `throughput` is stored as requests per microsecond, matching the unit
/// of every timestamp in the system. The completed-request count itself
/// lives on the connection; the schedule is a pure function of it plus
/// wall time, with a small amount of state for catch-up pacing.
#[derive(Debug, Clone)]
pub struct RateSchedule {
    thread_start: u64,
    throughput: f64,
    catch_up_throughput: f64,
    caught_up: bool,
    catch_up_start_time: u64,
    complete_at_catch_up_start: u64,
}

impl RateSchedule {
    /// Create a schedule anchored at `thread_start` (microseconds) with a
    /// per-connection target of `requests_per_sec`.
    pub fn new(thread_start: u64, requests_per_sec: f64) -> Self {
        let throughput = requests_per_sec / 1_000_000.0;
        Self {
            thread_start,
            throughput,
            catch_up_throughput: throughput * CATCH_UP_FACTOR,
            caught_up: true,
            catch_up_start_time: thread_start,
            complete_at_catch_up_start: 0,
        }
    }

    /// The instant (microseconds) the `k`-th request should be sent.
    ///
    /// Pure in `k`: `thread_start + k / throughput`, independent of any
    /// completion timing. Non-decreasing in `k` since throughput is
    /// positive.
    pub fn ideal_send_time(&self, k: u64) -> u64 {
        if self.throughput <= 0.0 {
            return self.thread_start;
        }
        self.thread_start + (k as f64 / self.throughput) as u64
    }

    /// Whether the connection is currently keeping pace with its schedule.
    pub fn caught_up(&self) -> bool {
        self.caught_up
    }

    /// Decide when request number `complete` (zero-based) may be sent.
    ///
    /// On schedule (`ideal_send_time(complete)` still in the future): arm
    /// a delay for that exact instant. Behind schedule: enter catch-up on
    /// the first overdue decision and pace back-to-back sends at the
    /// elevated catch-up rate from the catch-up origin, so the backlog
    /// drains without an unbounded burst. The connection is considered
    /// resynchronized as soon as the ideal send time moves back into the
    /// future, i.e. once `complete` reaches the count the ideal schedule
    /// mandates at the current wall time.
    pub fn next_send(&mut self, complete: u64, now: u64) -> SendTiming {
        if self.throughput <= 0.0 {
            return SendTiming::Immediate;
        }

        let ideal = self.ideal_send_time(complete);
        if ideal > now {
            // On pace again; leave catch-up mode if we were in it.
            self.caught_up = true;
            return SendTiming::Delay(ideal - now);
        }

        if self.caught_up {
            self.caught_up = false;
            self.catch_up_start_time = now;
            self.complete_at_catch_up_start = complete;
        }

        let since_catch_up = complete - self.complete_at_catch_up_start;
        let due = self.catch_up_start_time
            + (since_catch_up as f64 / self.catch_up_throughput) as u64;
        if due > now {
            SendTiming::Delay(due - now)
        } else {
            SendTiming::Immediate
        }
    }
}
