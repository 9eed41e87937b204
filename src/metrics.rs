use anyhow::Result;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

/// Smallest recordable latency, in microseconds.
pub const LATENCY_MIN_US: u64 = 1;

/// Largest recordable latency: one day, in microseconds.
///
/// Anything above this is clamped rather than rejected, so a pathological
/// sample never aborts a run.
pub const LATENCY_MAX_US: u64 = 24 * 60 * 60 * 1_000_000;

/// Significant decimal digits of precision kept by the histograms.
///
/// Three digits bounds the relative error of any reported value to about
/// 0.1% of the true value, regardless of magnitude.
pub const LATENCY_SIGFIGS: u8 = 3;

/// Which latency series a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatencyKind {
    /// Measured from the ideal send time the constant-rate schedule
    /// assigned to the request, even if the request was actually written
    /// later. The headline, coordinated-omission-corrected series.
    Corrected,
    /// Measured from the instant the request was fully written to the
    /// transport. What a naive closed-loop tester would report.
    Uncorrected,
}

/// Dual-histogram latency recorder owned by a single worker thread.
///
/// Holds one high-dynamic-range histogram per latency series. Never
/// locked: each worker mutates only its own recorder during the run, and
/// the coordinator merges recorders bucket-wise after all workers have
/// joined.
pub struct LatencyRecorder {
    corrected: Histogram<u64>,
    uncorrected: Histogram<u64>,
    record_corrected: bool,
    record_uncorrected: bool,
}

impl LatencyRecorder {
    /// Create a recorder covering 1us .. 24h at 3 significant digits.
    pub fn new(record_corrected: bool, record_uncorrected: bool) -> Result<Self> {
        Ok(Self {
            corrected: Histogram::new_with_bounds(LATENCY_MIN_US, LATENCY_MAX_US, LATENCY_SIGFIGS)?,
            uncorrected: Histogram::new_with_bounds(
                LATENCY_MIN_US,
                LATENCY_MAX_US,
                LATENCY_SIGFIGS,
            )?,
            record_corrected,
            record_uncorrected,
        })
    }

    /// Record one sample, clamping at the histogram maximum.
    ///
    /// `saturating_record` cannot fail for a histogram created with
    /// auto-resize disabled and a fixed upper bound, so recording adds no
    /// error path to the hot loop.
    pub fn record(&mut self, kind: LatencyKind, latency_us: u64) {
        let value = latency_us.max(LATENCY_MIN_US);
        match kind {
            LatencyKind::Corrected => {
                if self.record_corrected {
                    self.corrected.saturating_record(value);
                }
            }
            LatencyKind::Uncorrected => {
                if self.record_uncorrected {
                    self.uncorrected.saturating_record(value);
                }
            }
        }
    }

    /// Bucket-wise union of another recorder into this one.
    ///
    /// Used only by the coordinator after every worker has joined; both
    /// sides are quiescent at that point.
    pub fn merge(&mut self, other: &LatencyRecorder) -> Result<()> {
        self.corrected.add(&other.corrected)?;
        self.uncorrected.add(&other.uncorrected)?;
        Ok(())
    }

    /// Borrow the histogram backing one series.
    pub fn histogram(&self, kind: LatencyKind) -> &Histogram<u64> {
        match kind {
            LatencyKind::Corrected => &self.corrected,
            LatencyKind::Uncorrected => &self.uncorrected,
        }
    }

    /// Total samples recorded into one series.
    pub fn samples(&self, kind: LatencyKind) -> u64 {
        self.histogram(kind).len()
    }

    /// Summarize one series into serializable statistics.
    pub fn summarize(&self, kind: LatencyKind, percentiles: &[f64]) -> LatencySummary {
        let histogram = self.histogram(kind);
        let percentile_values = percentiles
            .iter()
            .map(|&p| PercentileValue {
                percentile: p,
                value_us: histogram.value_at_percentile(p),
            })
            .collect();
        LatencySummary {
            kind,
            min_us: histogram.min(),
            max_us: histogram.max(),
            mean_us: histogram.mean(),
            std_dev_us: histogram.stdev(),
            percentiles: percentile_values,
            total_samples: histogram.len(),
        }
    }
}

/// Statistics extracted from one latency series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySummary {
    pub kind: LatencyKind,
    pub min_us: u64,
    pub max_us: u64,
    pub mean_us: f64,
    pub std_dev_us: f64,
    pub percentiles: Vec<PercentileValue>,
    pub total_samples: u64,
}

/// Percentile value pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PercentileValue {
    pub percentile: f64,
    pub value_us: u64,
}

/// Per-thread error counters.
///
/// Mutated only by the owning worker; summed at merge. Transport failures
/// and timeouts force a reconnect of the affected connection but never
/// abort the run; status errors are protocol-level observations only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCounters {
    pub connect: u64,
    pub read: u64,
    pub write: u64,
    pub timeout: u64,
    pub status: u64,
}

impl ErrorCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum another thread's counters into this one.
    pub fn merge(&mut self, other: &ErrorCounters) {
        self.connect += other.connect;
        self.read += other.read;
        self.write += other.write;
        self.timeout += other.timeout;
        self.status += other.status;
    }

    /// Total count of transport-level failures (excludes status errors).
    pub fn transport_total(&self) -> u64 {
        self.connect + self.read + self.write + self.timeout
    }

    pub fn any(&self) -> bool {
        self.transport_total() + self.status > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_summarize() {
        let mut recorder = LatencyRecorder::new(true, true).unwrap();
        recorder.record(LatencyKind::Corrected, 1_000);
        recorder.record(LatencyKind::Corrected, 2_000);
        recorder.record(LatencyKind::Corrected, 3_000);
        recorder.record(LatencyKind::Uncorrected, 500);

        let summary = recorder.summarize(LatencyKind::Corrected, &[50.0, 99.0]);
        assert_eq!(summary.total_samples, 3);
        assert!(summary.mean_us > 0.0);
        assert_eq!(summary.percentiles.len(), 2);
        assert_eq!(recorder.samples(LatencyKind::Uncorrected), 1);
    }

    #[test]
    fn test_disabled_series_drops_samples() {
        let mut recorder = LatencyRecorder::new(true, false).unwrap();
        recorder.record(LatencyKind::Uncorrected, 1_000);
        recorder.record(LatencyKind::Corrected, 1_000);
        assert_eq!(recorder.samples(LatencyKind::Uncorrected), 0);
        assert_eq!(recorder.samples(LatencyKind::Corrected), 1);
    }

    #[test]
    fn test_relative_error_bound() {
        // Any recorded value must be reported within the configured
        // relative error (~0.1% at 3 significant digits).
        let mut recorder = LatencyRecorder::new(true, true).unwrap();
        for &value in &[1u64, 17, 999, 12_345, 1_000_000, 86_000_000_000] {
            recorder.record(LatencyKind::Corrected, value);
            let histogram = recorder.histogram(LatencyKind::Corrected);
            let reported = histogram.highest_equivalent(value);
            let error = (reported as f64 - value as f64).abs() / value as f64;
            assert!(
                error <= 0.001 + f64::EPSILON,
                "value {} reported as {} (error {})",
                value,
                reported,
                error
            );
        }
    }

    #[test]
    fn test_clamp_at_maximum() {
        let mut recorder = LatencyRecorder::new(true, true).unwrap();
        recorder.record(LatencyKind::Corrected, LATENCY_MAX_US * 10);
        assert_eq!(recorder.samples(LatencyKind::Corrected), 1);
        assert!(recorder.histogram(LatencyKind::Corrected).max() <= LATENCY_MAX_US);
    }

    #[test]
    fn test_merge_sums_counts() {
        let mut a = LatencyRecorder::new(true, true).unwrap();
        let mut b = LatencyRecorder::new(true, true).unwrap();
        // Disjoint sample sets.
        for v in [100u64, 200, 300] {
            a.record(LatencyKind::Corrected, v);
        }
        for v in [10_000u64, 20_000] {
            b.record(LatencyKind::Corrected, v);
        }

        let mut merged_ab = LatencyRecorder::new(true, true).unwrap();
        merged_ab.merge(&a).unwrap();
        merged_ab.merge(&b).unwrap();

        // Commutative: merging in the other order gives identical counts.
        let mut merged_ba = LatencyRecorder::new(true, true).unwrap();
        merged_ba.merge(&b).unwrap();
        merged_ba.merge(&a).unwrap();

        assert_eq!(merged_ab.samples(LatencyKind::Corrected), 5);
        assert_eq!(
            merged_ab.samples(LatencyKind::Corrected),
            merged_ba.samples(LatencyKind::Corrected)
        );
        for v in [100u64, 200, 300, 10_000, 20_000] {
            let expect = merged_ba
                .histogram(LatencyKind::Corrected)
                .count_at(v);
            assert_eq!(merged_ab.histogram(LatencyKind::Corrected).count_at(v), expect);
            assert_eq!(expect, 1);
        }
    }

    #[test]
    fn test_error_counters_merge() {
        let mut a = ErrorCounters {
            connect: 1,
            read: 2,
            write: 3,
            timeout: 4,
            status: 5,
        };
        let b = ErrorCounters {
            connect: 10,
            read: 20,
            write: 30,
            timeout: 40,
            status: 50,
        };
        a.merge(&b);
        assert_eq!(a.connect, 11);
        assert_eq!(a.read, 22);
        assert_eq!(a.write, 33);
        assert_eq!(a.timeout, 44);
        assert_eq!(a.status, 55);
        assert_eq!(a.transport_total(), 110);
        assert!(a.any());
        assert!(!ErrorCounters::new().any());
    }
}
