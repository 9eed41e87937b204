//! # Utility Functions and Helper Module
//!
//! Shared helpers used throughout the load generator: the monotonic
//! microsecond clock that every scheduling decision and latency sample is
//! based on, human-readable formatters for the final report, input
//! validation with clear error messages, and the connection/rate
//! partitioning logic used by the run coordinator.
//!
//! ## Key Functionality Categories
//!
//! - **Timing**: process-wide monotonic microsecond clock
//! - **Formatting**: human-readable display of durations, bytes, and rates
//! - **Validation**: input parameter validation with clear error messages
//! - **Partitioning**: splitting connections and throughput across threads

use anyhow::Result;
use std::sync::OnceLock;
use std::time::Instant;

/// Anchor for the process-wide monotonic clock.
///
/// All timestamps in the scheduler, the state machine and the histograms
/// are microseconds relative to this instant, so values from different
/// worker threads are directly comparable and merge cleanly.
static CLOCK_ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Current time in microseconds on the process-wide monotonic clock.
///
/// The first call anchors the clock; every later call returns the elapsed
/// microseconds since that anchor. Monotonic by construction (backed by
/// `Instant`), so it is safe to subtract two readings regardless of which
/// thread took them.
pub fn time_us() -> u64 {
    let anchor = CLOCK_ANCHOR.get_or_init(Instant::now);
    anchor.elapsed().as_micros() as u64
}

/// Format a microsecond duration in a human-readable way.
///
/// Selects the most appropriate unit for the magnitude:
/// microseconds below 1 ms, milliseconds below 1 s, seconds with two
/// decimals above that, and a compound `XmYs` form past one minute.
pub fn format_duration_us(us: u64) -> String {
    if us < 1_000 {
        format!("{}us", us)
    } else if us < 1_000_000 {
        format!("{:.2}ms", us as f64 / 1_000.0)
    } else if us < 60_000_000 {
        format!("{:.2}s", us as f64 / 1_000_000.0)
    } else {
        let secs = us / 1_000_000;
        let minutes = secs / 60;
        let remaining = secs % 60;
        if minutes < 60 {
            format!("{}m {}s", minutes, remaining)
        } else {
            format!("{}h {}m {}s", minutes / 60, minutes % 60, remaining)
        }
    }
}

/// Format bytes in a human-readable way using binary (1024-based) scaling.
pub fn format_bytes(bytes: u64) -> String {
    format_bytes_f64(bytes as f64)
}

/// Format bytes (as f64) in a human-readable way.
///
/// Shared by [`format_bytes`] and [`format_rate`] so counts and rates use
/// identical scaling and precision.
pub fn format_bytes_f64(bytes: f64) -> String {
    if bytes < 1024.0 {
        format!("{:.0} B", bytes)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a transfer rate (bytes per second) with a "/s" suffix.
pub fn format_rate(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes_f64(bytes_per_second))
}

/// Format a request rate in a human-readable way using decimal scaling.
pub fn format_request_rate(requests_per_second: f64) -> String {
    if requests_per_second < 1000.0 {
        format!("{:.2} req/s", requests_per_second)
    } else if requests_per_second < 1_000_000.0 {
        format!("{:.2}K req/s", requests_per_second / 1000.0)
    } else {
        format!("{:.2}M req/s", requests_per_second / 1_000_000.0)
    }
}

/// Split `total` items across `buckets` slots, remainder to slot 0.
///
/// This is the partitioning rule for connections-per-thread: every slot
/// receives `total / buckets` and slot 0 additionally receives
/// `total % buckets`, so the parts always sum back to `total`.
pub fn partition_evenly(total: u64, buckets: usize) -> Vec<u64> {
    let buckets = buckets.max(1);
    let share = total / buckets as u64;
    let remainder = total % buckets as u64;
    (0..buckets)
        .map(|i| if i == 0 { share + remainder } else { share })
        .collect()
}

/// Validate that the target request rate is usable.
pub fn validate_rate(rate: u64) -> Result<()> {
    if rate == 0 {
        anyhow::bail!("Target rate cannot be zero (use -R to set requests/sec)");
    }
    Ok(())
}

/// Validate the thread/connection relationship.
///
/// Each worker thread needs at least one connection to drive, so the
/// total connection count must be at least the thread count.
pub fn validate_connections(connections: u64, threads: u64) -> Result<()> {
    if threads == 0 {
        anyhow::bail!("Thread count cannot be zero");
    }
    if connections < threads {
        anyhow::bail!(
            "Connection count {} is lower than thread count {} (each thread needs at least one connection)",
            connections,
            threads
        );
    }
    Ok(())
}

/// Validate the pipeline depth.
pub fn validate_pipeline(pipeline: u64) -> Result<()> {
    if pipeline == 0 {
        anyhow::bail!("Pipeline depth cannot be zero");
    }
    if pipeline > 1024 {
        anyhow::bail!("Pipeline depth {} is too high (maximum 1024)", pipeline);
    }
    Ok(())
}

/// Get the number of logical CPU cores available to the process.
pub fn get_cpu_cores() -> usize {
    num_cpus::get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_us_monotonic() {
        let a = time_us();
        let b = time_us();
        assert!(b >= a);
    }

    #[test]
    fn test_format_duration_us() {
        assert_eq!(format_duration_us(500), "500us");
        assert_eq!(format_duration_us(1_500), "1.50ms");
        assert_eq!(format_duration_us(1_500_000), "1.50s");
        assert_eq!(format_duration_us(90_000_000), "1m 30s");
        assert_eq!(format_duration_us(3_690_000_000), "1h 1m 30s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1572864), "1.50 MB");
        assert_eq!(format_bytes(1610612736), "1.50 GB");
    }

    #[test]
    fn test_format_request_rate() {
        assert_eq!(format_request_rate(500.0), "500.00 req/s");
        assert_eq!(format_request_rate(1500.0), "1.50K req/s");
        assert_eq!(format_request_rate(2_300_000.0), "2.30M req/s");
    }

    #[test]
    fn test_partition_evenly_remainder_to_first() {
        // The 5-connections-over-2-threads case: thread 0 takes the spare.
        assert_eq!(partition_evenly(5, 2), vec![3, 2]);
        assert_eq!(partition_evenly(6, 3), vec![2, 2, 2]);
        assert_eq!(partition_evenly(7, 3), vec![3, 2, 2]);
        assert_eq!(partition_evenly(1, 1), vec![1]);
    }

    #[test]
    fn test_partition_evenly_sums_to_total() {
        for threads in 1..=16usize {
            for connections in threads as u64..=threads as u64 * 7 {
                let parts = partition_evenly(connections, threads);
                assert_eq!(parts.len(), threads);
                assert_eq!(parts.iter().sum::<u64>(), connections);
            }
        }
    }

    #[test]
    fn test_validate_rate() {
        assert!(validate_rate(1).is_ok());
        assert!(validate_rate(1_000_000).is_ok());
        assert!(validate_rate(0).is_err());
    }

    #[test]
    fn test_validate_connections() {
        assert!(validate_connections(4, 2).is_ok());
        assert!(validate_connections(2, 2).is_ok());
        assert!(validate_connections(1, 2).is_err());
        assert!(validate_connections(1, 0).is_err());
    }

    #[test]
    fn test_validate_pipeline() {
        assert!(validate_pipeline(1).is_ok());
        assert!(validate_pipeline(16).is_ok());
        assert!(validate_pipeline(0).is_err());
        assert!(validate_pipeline(2048).is_err());
    }
}
