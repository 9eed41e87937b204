use anyhow::Result;
use http_loadgen::runner::{CancelToken, Coordinator, RunConfig};
use http_loadgen::transport::TcpConnector;
use http_loadgen::workload::StaticWorkload;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

/// A target that refuses every connect must not abort the run: the
/// attempts are counted, nothing completes, and the coordinator still
/// returns a clean summary at the deadline.
#[test]
fn connect_refused_is_counted_not_fatal() -> Result<()> {
    // Bind then drop to obtain a port with no listener behind it.
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);

    let config = RunConfig {
        threads: 1,
        connections: 2,
        rate: 100,
        duration: Duration::from_millis(500),
        timeout: Duration::from_millis(200),
        pipeline: 1,
        batch_latency: false,
        record_corrected_latency: true,
        record_uncorrected_latency: true,
        record_all_responses: true,
        pin_cpus: false,
        host: addr.ip().to_string(),
        port: addr.port(),
    };
    let workload = StaticWorkload::new("GET", "/", "127.0.0.1", &[], None);
    let coordinator = Coordinator::new(
        config,
        Arc::new(TcpConnector::new()),
        Arc::new(workload),
        Vec::new(),
    );

    let summary = coordinator.run(CancelToken::new())?;

    assert_eq!(summary.complete, 0);
    assert!(
        summary.errors.connect > 0,
        "refused connects must be counted: {:?}",
        summary.errors
    );
    assert_eq!(summary.errors.status, 0);
    Ok(())
}
