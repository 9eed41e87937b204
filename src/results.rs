use crate::metrics::{ErrorCounters, LatencyKind, LatencySummary};
use crate::runner::{RunConfig, RunSummary};
use crate::utils::{format_bytes, format_duration_us, format_rate, format_request_rate};
use anyhow::Result;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Percentile levels reported for each latency series.
const REPORT_PERCENTILES: &[f64] = &[50.0, 75.0, 90.0, 99.0, 99.9, 99.99, 100.0];

/// Complete, serializable result of one run.
///
/// Built entirely from the merged [`RunSummary`] the coordinator hands
/// back; printing and JSON output are both views over this structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    pub config: RunConfig,
    pub totals: Totals,
    /// Schedule-corrected latency distribution (the headline series).
    pub corrected_latency: Option<LatencySummary>,
    /// Actual-send-to-completion latency distribution.
    pub uncorrected_latency: Option<LatencySummary>,
    pub errors: ErrorCounters,
    pub system_info: SystemInfo,
}

/// Identification block for reproducibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub run_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
}

/// Aggregate throughput numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Totals {
    pub completions: u64,
    pub requests_issued: u64,
    pub bytes_read: u64,
    pub duration_us: u64,
    pub requests_per_sec: f64,
    pub bytes_per_sec: f64,
}

/// Host details recorded alongside the numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
}

impl Report {
    /// Assemble the report from the merged run state.
    pub fn build(config: &RunConfig, summary: &RunSummary) -> Self {
        let corrected_latency = if config.record_corrected_latency
            && summary.recorder.samples(LatencyKind::Corrected) > 0
        {
            Some(
                summary
                    .recorder
                    .summarize(LatencyKind::Corrected, REPORT_PERCENTILES),
            )
        } else {
            None
        };
        let uncorrected_latency = if config.record_uncorrected_latency
            && summary.recorder.samples(LatencyKind::Uncorrected) > 0
        {
            Some(
                summary
                    .recorder
                    .summarize(LatencyKind::Uncorrected, REPORT_PERCENTILES),
            )
        } else {
            None
        };

        Self {
            metadata: ReportMetadata {
                run_id: uuid::Uuid::new_v4().to_string(),
                timestamp: chrono::Utc::now(),
                version: crate::VERSION.to_string(),
            },
            config: config.clone(),
            totals: Totals {
                completions: summary.complete,
                requests_issued: summary.requests,
                bytes_read: summary.bytes,
                duration_us: summary.duration_us,
                requests_per_sec: summary.requests_per_sec(),
                bytes_per_sec: summary.bytes_per_sec(),
            },
            corrected_latency,
            uncorrected_latency,
            errors: summary.errors,
            system_info: SystemInfo {
                os: std::env::consts::OS.to_string(),
                architecture: std::env::consts::ARCH.to_string(),
                cpu_cores: crate::utils::get_cpu_cores(),
            },
        }
    }

    /// Print the human-readable summary to stdout.
    ///
    /// The overview block always prints; the full percentile spectra
    /// print only for the series the operator asked for with `-L`/`-U`.
    pub fn print(&self, show_corrected: bool, show_uncorrected: bool) {
        println!(
            "  {} requests in {}, {} read",
            self.totals.completions,
            format_duration_us(self.totals.duration_us),
            format_bytes(self.totals.bytes_read)
        );

        if self.errors.any() {
            let line = format!(
                "  Socket errors: connect {}, read {}, write {}, timeout {}",
                self.errors.connect, self.errors.read, self.errors.write, self.errors.timeout
            );
            println!("{}", line.red());
            if self.errors.status > 0 {
                println!(
                    "{}",
                    format!("  Non-2xx or 3xx responses: {}", self.errors.status).red()
                );
            }
        }

        println!(
            "{} {}",
            "Requests/sec:".bold(),
            format_request_rate(self.totals.requests_per_sec)
        );
        println!(
            "{} {}",
            "Transfer/sec:".bold(),
            format_rate(self.totals.bytes_per_sec)
        );

        if let Some(ref summary) = self.corrected_latency {
            print_overview("Latency (corrected for coordinated omission)", summary);
            if show_corrected {
                print_spectrum(summary);
            }
        }
        if let Some(ref summary) = self.uncorrected_latency {
            print_overview("Uncorrected latency (actual send to completion)", summary);
            if show_uncorrected {
                print_spectrum(summary);
            }
        }
    }

    /// Write the report as pretty-printed JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

fn print_overview(title: &str, summary: &LatencySummary) {
    println!();
    println!("  {}", title.bold());
    println!(
        "    mean {:>12}  stdev {:>12}  max {:>12}  ({} samples)",
        format_duration_us(summary.mean_us as u64),
        format_duration_us(summary.std_dev_us as u64),
        format_duration_us(summary.max_us),
        summary.total_samples
    );
}

fn print_spectrum(summary: &LatencySummary) {
    println!("  Latency distribution:");
    for pv in &summary.percentiles {
        println!(
            "    {:>8.3}%  {:>12}",
            pv.percentile,
            format_duration_us(pv.value_us)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{LatencyKind, LatencyRecorder};
    use std::time::Duration;

    fn test_config() -> RunConfig {
        RunConfig {
            threads: 1,
            connections: 1,
            rate: 100,
            duration: Duration::from_secs(1),
            timeout: Duration::from_millis(500),
            pipeline: 1,
            batch_latency: false,
            record_corrected_latency: true,
            record_uncorrected_latency: true,
            record_all_responses: true,
            pin_cpus: false,
            host: "localhost".to_string(),
            port: 80,
        }
    }

    fn test_summary() -> RunSummary {
        let mut recorder = LatencyRecorder::new(true, true).unwrap();
        for v in [1_000u64, 2_000, 4_000, 8_000] {
            recorder.record(LatencyKind::Corrected, v);
            recorder.record(LatencyKind::Uncorrected, v / 2);
        }
        RunSummary {
            complete: 4,
            requests: 4,
            bytes: 4096,
            duration_us: 2_000_000,
            recorder,
            errors: ErrorCounters::new(),
        }
    }

    #[test]
    fn test_build_totals() {
        let report = Report::build(&test_config(), &test_summary());
        assert_eq!(report.totals.completions, 4);
        assert_eq!(report.totals.bytes_read, 4096);
        // 4 completions over 2 seconds.
        assert!((report.totals.requests_per_sec - 2.0).abs() < 1e-9);
        assert!(report.corrected_latency.is_some());
        assert!(report.uncorrected_latency.is_some());
        assert_eq!(
            report.corrected_latency.unwrap().total_samples,
            4
        );
    }

    #[test]
    fn test_empty_series_omitted() {
        let mut config = test_config();
        config.record_uncorrected_latency = false;
        let mut summary = test_summary();
        summary.recorder = LatencyRecorder::new(true, false).unwrap();
        summary.recorder.record(LatencyKind::Corrected, 1_000);
        let report = Report::build(&config, &summary);
        assert!(report.corrected_latency.is_some());
        assert!(report.uncorrected_latency.is_none());
    }

    #[test]
    fn test_json_round_trip() {
        let report = Report::build(&test_config(), &test_summary());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        report.write_json(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: Report = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.totals.completions, report.totals.completions);
        assert_eq!(parsed.metadata.run_id, report.metadata.run_id);
    }

    #[test]
    fn test_print_does_not_panic() {
        let report = Report::build(&test_config(), &test_summary());
        report.print(true, true);
    }
}
