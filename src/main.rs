//! # HTTP Loadgen - Main Entry Point
//!
//! The binary wires together the pieces the library keeps separate:
//!
//! 1. **Initialize logging**: structured output via tracing, colored by
//!    severity for interactive use
//! 2. **Parse arguments**: command-line configuration including the
//!    target URL and the required rate
//! 3. **Build the run**: configuration snapshot, static workload, plain
//!    TCP transport
//! 4. **Wire signals**: Ctrl-C flips the cancellation token the workers
//!    poll, so an interrupted run still reports what it measured
//! 5. **Execute and report**: run to the deadline, merge per-thread
//!    measurements, print the summary and optionally write JSON
//!
//! Exit code 0 on normal completion (including runs that saw only
//! recoverable per-connection errors); non-zero for configuration or
//! fatal startup errors.

use anyhow::Result;
use clap::Parser;
use http_loadgen::cli::{self, Args};
use http_loadgen::results::Report;
use http_loadgen::runner::{CancelToken, Coordinator, RunConfig};
use http_loadgen::transport::TcpConnector;
use http_loadgen::utils::format_duration_us;
use std::sync::Arc;
use tracing::{info, warn};

fn main() -> Result<()> {
    let args = Args::parse();
    http_loadgen::logging::init(args.verbose);

    let config = RunConfig::from_args(&args)?;
    let target = cli::parse_url(&args.url)?;
    let workload = Arc::new(cli::build_workload(&args, &target)?);
    let connector = Arc::new(TcpConnector::new());

    info!(
        "Running {} test @ {}",
        format_duration_us(config.duration.as_micros() as u64),
        args.url
    );
    info!(
        "  {} threads and {} connections, {} req/s target",
        config.threads, config.connections, config.rate
    );

    // One-shot stop flag: first Ctrl-C requests wind-down, workers
    // observe it at their next poll cycle.
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            cancel.cancel();
        })?;
    }

    let coordinator = Coordinator::new(config.clone(), connector, workload, args.workload_args.clone());
    let summary = coordinator.run(cancel.clone())?;

    if cancel.is_cancelled() {
        warn!("Run interrupted; reporting what was measured");
    }

    let report = Report::build(&config, &summary);
    report.print(args.latency, args.u_latency);

    if let Some(ref path) = args.output_file {
        report.write_json(path)?;
        info!("Report written to {:?}", path);
    }

    Ok(())
}
