use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::workload::StaticWorkload;

/// HTTP Loadgen - constant-throughput HTTP load generation with
/// coordinated-omission-corrected latency reporting
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Target URL (http://host[:port][/path])
    pub url: String,

    /// Extra arguments handed to the workload strategy's init hook
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    pub workload_args: Vec<String>,

    /// Connections to keep open (SI suffixes allowed: 1k, 1M)
    #[clap(short = 'c', long, value_parser = parse_count, default_value_t = crate::defaults::CONNECTIONS, help_heading = "Load Shape")]
    pub connections: u64,

    /// Duration of the test (e.g. 10s, 2m, 1h)
    #[clap(short = 'd', long, value_parser = parse_duration, default_value = "10s", help_heading = "Load Shape")]
    pub duration: Duration,

    /// Number of worker threads
    #[clap(short = 't', long, default_value_t = crate::defaults::THREADS, help_heading = "Load Shape")]
    pub threads: u64,

    /// Total work rate in requests/sec across all connections (required;
    /// SI suffixes allowed)
    #[clap(short = 'R', long, value_parser = parse_count, help_heading = "Load Shape")]
    pub rate: u64,

    /// Requests written back-to-back per send (HTTP pipelining depth)
    #[clap(short = 'p', long, default_value_t = crate::defaults::PIPELINE, help_heading = "Load Shape")]
    pub pipeline: u64,

    /// Add a header to every request (repeatable; "Name: value")
    #[clap(short = 'H', long = "header", help_heading = "Request")]
    pub headers: Vec<String>,

    /// HTTP method
    #[clap(short = 'M', long, default_value = "GET", help_heading = "Request")]
    pub method: String,

    /// Request body (switches the default Content-Length on)
    #[clap(long, help_heading = "Request")]
    pub body: Option<String>,

    /// Socket/request timeout (e.g. 500ms, 2s)
    #[clap(long, value_parser = parse_duration, default_value = "500ms")]
    pub timeout: Duration,

    /// Print the corrected latency distribution
    #[clap(short = 'L', long, default_value_t = false, help_heading = "Reporting")]
    pub latency: bool,

    /// Print the uncorrected latency distribution
    #[clap(short = 'U', long = "u-latency", default_value_t = false, help_heading = "Reporting")]
    pub u_latency: bool,

    /// Measure latency of whole pipelined batches instead of each request
    #[clap(short = 'B', long, default_value_t = false, help_heading = "Reporting")]
    pub batch_latency: bool,

    /// Record every response; set to false to drop samples from the
    /// initial calibration window
    #[clap(long, default_value_t = true, help_heading = "Reporting")]
    pub record_all_responses: bool,

    /// Write the full report as JSON to this file
    #[clap(short = 'o', long, help_heading = "Reporting")]
    pub output_file: Option<PathBuf>,

    /// Pin worker threads to distinct CPU cores
    #[clap(long, default_value_t = false)]
    pub pin_cpus: bool,

    /// Verbose output
    #[clap(short = 'v', long, default_value_t = false)]
    pub verbose: bool,
}

/// Host, port and path extracted from the target URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Target {
    /// Value for the Host header: the port is included only when it is
    /// not the default.
    pub fn host_header(&self) -> String {
        if self.port == 80 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Parse the target URL. Only plain `http` targets are supported; a TLS
/// backend would plug in behind the transport seam, but this build does
/// not carry one.
pub fn parse_url(url: &str) -> Result<Target> {
    let rest = if let Some(stripped) = strip_scheme(url, "http://") {
        stripped
    } else if strip_scheme(url, "https://").is_some() {
        bail!("https targets need a TLS transport backend, which this build does not include");
    } else if url.contains("://") {
        bail!("Unsupported URL scheme in '{}'", url);
    } else {
        url
    };

    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        bail!("URL '{}' has no host", url);
    }

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        // IPv6 literal: [::1] or [::1]:8080
        let end = bracketed
            .find(']')
            .ok_or_else(|| anyhow::anyhow!("Unterminated IPv6 literal in '{}'", url))?;
        let host = &bracketed[..end];
        match bracketed[end + 1..].strip_prefix(':') {
            Some(port_text) => (host, parse_port(port_text, url)?),
            None if bracketed[end + 1..].is_empty() => (host, 80),
            None => bail!("Malformed authority in '{}'", url),
        }
    } else if let Some(i) = authority.rfind(':') {
        (&authority[..i], parse_port(&authority[i + 1..], url)?)
    } else {
        (authority, 80)
    };
    if host.is_empty() {
        bail!("URL '{}' has no host", url);
    }

    Ok(Target {
        host: host.to_string(),
        port,
        path: path.to_string(),
    })
}

fn strip_scheme<'a>(url: &'a str, scheme: &str) -> Option<&'a str> {
    if url.len() >= scheme.len() && url[..scheme.len()].eq_ignore_ascii_case(scheme) {
        Some(&url[scheme.len()..])
    } else {
        None
    }
}

fn parse_port(text: &str, url: &str) -> Result<u16> {
    text.parse::<u16>()
        .map_err(|_| anyhow::anyhow!("Invalid port in '{}'", url))
}

/// Build the default static workload from the parsed arguments.
pub fn build_workload(args: &Args, target: &Target) -> Result<StaticWorkload> {
    let mut headers = Vec::with_capacity(args.headers.len());
    for raw in &args.headers {
        headers.push(parse_header(raw)?);
    }
    Ok(StaticWorkload::new(
        &args.method,
        &target.path,
        &target.host_header(),
        &headers,
        args.body.as_deref().map(str::as_bytes),
    ))
}

/// Split a `Name: value` header argument.
fn parse_header(raw: &str) -> Result<(String, String)> {
    let colon = raw
        .find(':')
        .ok_or_else(|| anyhow::anyhow!("Header '{}' is missing a ':'", raw))?;
    let name = raw[..colon].trim();
    let value = raw[colon + 1..].trim();
    if name.is_empty() {
        bail!("Header '{}' has an empty name", raw);
    }
    Ok((name.to_string(), value.to_string()))
}

/// Parse a count with an optional SI suffix (1k, 2M, 1G).
fn parse_count(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Count cannot be empty".to_string());
    }
    let (num_str, multiplier) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 1_000u64),
        Some('m') | Some('M') => (&s[..s.len() - 1], 1_000_000),
        Some('g') | Some('G') => (&s[..s.len() - 1], 1_000_000_000),
        _ => (s, 1),
    };
    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in count: {}", num_str))?;
    if num < 0.0 {
        return Err(format!("Count cannot be negative: {}", s));
    }
    Ok((num * multiplier as f64) as u64)
}

/// Parse duration from string (e.g., "500ms", "10s", "5m", "1h").
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

    let duration = match unit {
        "ms" => Duration::from_millis(num as u64),
        "s" => Duration::from_secs(num as u64),
        "m" => Duration::from_secs((num * 60.0) as u64),
        "h" => Duration::from_secs((num * 3600.0) as u64),
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count("100").unwrap(), 100);
        assert_eq!(parse_count("2k").unwrap(), 2_000);
        assert_eq!(parse_count("1.5k").unwrap(), 1_500);
        assert_eq!(parse_count("3M").unwrap(), 3_000_000);
        assert_eq!(parse_count("1G").unwrap(), 1_000_000_000);

        assert!(parse_count("").is_err());
        assert!(parse_count("x").is_err());
        assert!(parse_count("-5").is_err());
    }

    #[test]
    fn test_parse_url_forms() {
        assert_eq!(
            parse_url("http://example.com").unwrap(),
            Target {
                host: "example.com".to_string(),
                port: 80,
                path: "/".to_string(),
            }
        );
        assert_eq!(
            parse_url("http://example.com:8080/a/b?q=1").unwrap(),
            Target {
                host: "example.com".to_string(),
                port: 8080,
                path: "/a/b?q=1".to_string(),
            }
        );
        // Scheme-less shorthand.
        assert_eq!(
            parse_url("localhost:9000/x").unwrap(),
            Target {
                host: "localhost".to_string(),
                port: 9000,
                path: "/x".to_string(),
            }
        );
        // IPv6 literal.
        assert_eq!(
            parse_url("http://[::1]:8080/").unwrap(),
            Target {
                host: "::1".to_string(),
                port: 8080,
                path: "/".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_url_rejects_unsupported() {
        assert!(parse_url("https://example.com").is_err());
        assert!(parse_url("ftp://example.com").is_err());
        assert!(parse_url("http://").is_err());
        assert!(parse_url("http://example.com:notaport/").is_err());
    }

    #[test]
    fn test_host_header_omits_default_port() {
        assert_eq!(
            parse_url("http://example.com/").unwrap().host_header(),
            "example.com"
        );
        assert_eq!(
            parse_url("http://example.com:8080/").unwrap().host_header(),
            "example.com:8080"
        );
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("Accept: text/html").unwrap(),
            ("Accept".to_string(), "text/html".to_string())
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": empty-name").is_err());
    }

    #[test]
    fn test_args_parse_minimal() {
        let args =
            Args::try_parse_from(["http-loadgen", "-R", "1000", "http://localhost:8080/"])
                .unwrap();
        assert_eq!(args.rate, 1000);
        assert_eq!(args.connections, crate::defaults::CONNECTIONS);
        assert_eq!(args.threads, crate::defaults::THREADS);
        assert_eq!(args.duration, Duration::from_secs(10));
        assert!(args.record_all_responses);
    }

    #[test]
    fn test_args_rate_is_required() {
        assert!(Args::try_parse_from(["http-loadgen", "http://localhost/"]).is_err());
    }

    #[test]
    fn test_args_full() {
        let args = Args::try_parse_from([
            "http-loadgen",
            "-t",
            "4",
            "-c",
            "1k",
            "-d",
            "30s",
            "-R",
            "50k",
            "-H",
            "Accept: */*",
            "-H",
            "X-Bench: 1",
            "-L",
            "-U",
            "--timeout",
            "2s",
            "http://10.0.0.1:8080/index.html",
        ])
        .unwrap();
        assert_eq!(args.threads, 4);
        assert_eq!(args.connections, 1000);
        assert_eq!(args.rate, 50_000);
        assert_eq!(args.headers.len(), 2);
        assert!(args.latency);
        assert!(args.u_latency);
        assert_eq!(args.timeout, Duration::from_secs(2));
    }
}
