//! Request-generation and response-observation strategies.
//!
//! The core treats request construction as a pluggable strategy: a
//! [`Workload`] builds request bytes, optionally observes parsed
//! responses, and may override address resolution. The default
//! [`StaticWorkload`] renders one request buffer up front and serves it
//! for every send, which is the common constant-workload case; an
//! embedding application can supply a dynamic strategy (for example one
//! backed by an embedded interpreter) without the core knowing.

use std::net::{SocketAddr, ToSocketAddrs};

/// Per-thread context handed to workload lifecycle hooks.
#[derive(Debug, Clone)]
pub struct ThreadContext {
    pub thread_id: usize,
    pub connections: u64,
    pub requests_per_sec: f64,
}

/// A parsed response exposed to [`Workload::observe_response`].
#[derive(Debug)]
pub struct ResponseView<'a> {
    pub status: u16,
    pub headers: &'a [(Vec<u8>, Vec<u8>)],
    pub body: &'a [u8],
}

/// Pluggable request-generation strategy.
///
/// Implementations must be shareable across worker threads; any internal
/// mutability is the strategy's own concern.
pub trait Workload: Send + Sync {
    /// Called once per worker thread before its first connection opens.
    fn setup(&self, _thread: &ThreadContext) {}

    /// Called once per worker thread with the arguments the operator
    /// passed after the target URL.
    fn init(&self, _thread: &ThreadContext, _args: &[String]) {}

    /// Produce the bytes of the next request.
    fn build_request(&self) -> Vec<u8>;

    /// Whether every call to [`Workload::build_request`] may return
    /// different bytes. Static workloads return false so connections can
    /// render the request once and reuse the buffer across cycles.
    fn is_dynamic(&self) -> bool {
        false
    }

    /// Whether [`Workload::observe_response`] wants header and body
    /// capture. When false the hot path skips accumulating them.
    fn wants_response(&self) -> bool {
        false
    }

    /// Observe a completed response (only when [`Self::wants_response`]).
    fn observe_response(&self, _response: &ResponseView<'_>) {}

    /// Optionally override target address resolution.
    fn resolve(&self, _host: &str, _port: u16) -> Option<Vec<SocketAddr>> {
        None
    }

    /// True when the requests are HEAD requests (their responses carry
    /// Content-Length but no body).
    fn is_head(&self) -> bool {
        false
    }
}

/// Resolve the target address, preferring the workload's override.
pub fn resolve_target(
    workload: &dyn Workload,
    host: &str,
    port: u16,
) -> anyhow::Result<SocketAddr> {
    if let Some(addrs) = workload.resolve(host, port) {
        return addrs
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("workload resolver returned no addresses for {}:{}", host, port));
    }
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| anyhow::anyhow!("unable to resolve {}:{}: {}", host, port, e))?;
    addrs
        .next()
        .ok_or_else(|| anyhow::anyhow!("no addresses found for {}:{}", host, port))
}

/// The default strategy: one fixed HTTP/1.1 request, rendered once.
pub struct StaticWorkload {
    request: Vec<u8>,
    head: bool,
}

impl StaticWorkload {
    /// Render a request from its parts. `headers` are raw `Name: value`
    /// pairs; `Host`, and `Content-Length` for bodied requests, are
    /// filled in unless the caller already provided them.
    pub fn new(
        method: &str,
        path: &str,
        host_header: &str,
        headers: &[(String, String)],
        body: Option<&[u8]>,
    ) -> Self {
        let mut request = Vec::with_capacity(256);
        request.extend_from_slice(method.as_bytes());
        request.push(b' ');
        request.extend_from_slice(path.as_bytes());
        request.extend_from_slice(b" HTTP/1.1\r\n");

        let has = |name: &str| {
            headers
                .iter()
                .any(|(n, _)| n.eq_ignore_ascii_case(name))
        };

        if !has("host") {
            request.extend_from_slice(b"Host: ");
            request.extend_from_slice(host_header.as_bytes());
            request.extend_from_slice(b"\r\n");
        }
        for (name, value) in headers {
            request.extend_from_slice(name.as_bytes());
            request.extend_from_slice(b": ");
            request.extend_from_slice(value.as_bytes());
            request.extend_from_slice(b"\r\n");
        }
        if let Some(body) = body {
            if !has("content-length") {
                request.extend_from_slice(
                    format!("Content-Length: {}\r\n", body.len()).as_bytes(),
                );
            }
        }
        request.extend_from_slice(b"\r\n");
        if let Some(body) = body {
            request.extend_from_slice(body);
        }

        Self {
            request,
            head: method.eq_ignore_ascii_case("HEAD"),
        }
    }
}

impl Workload for StaticWorkload {
    fn build_request(&self) -> Vec<u8> {
        self.request.clone()
    }

    fn is_head(&self) -> bool {
        self.head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_request_rendering() {
        let workload = StaticWorkload::new("GET", "/index.html", "example.com:8080", &[], None);
        let request = workload.build_request();
        let text = String::from_utf8(request).unwrap();
        assert!(text.starts_with("GET /index.html HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com:8080\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert!(!workload.is_dynamic());
        assert!(!workload.is_head());
    }

    #[test]
    fn test_custom_host_header_not_duplicated() {
        let headers = vec![("Host".to_string(), "override.example".to_string())];
        let workload = StaticWorkload::new("GET", "/", "ignored.example", &headers, None);
        let text = String::from_utf8(workload.build_request()).unwrap();
        assert_eq!(text.matches("Host:").count(), 1);
        assert!(text.contains("Host: override.example\r\n"));
    }

    #[test]
    fn test_body_gets_content_length() {
        let workload = StaticWorkload::new("POST", "/submit", "example.com", &[], Some(b"payload"));
        let text = String::from_utf8(workload.build_request()).unwrap();
        assert!(text.contains("Content-Length: 7\r\n"));
        assert!(text.ends_with("\r\n\r\npayload"));
    }

    #[test]
    fn test_head_method_flag() {
        let workload = StaticWorkload::new("HEAD", "/", "example.com", &[], None);
        assert!(workload.is_head());
    }

    #[test]
    fn test_resolve_target_default_path() {
        struct Plain;
        impl Workload for Plain {
            fn build_request(&self) -> Vec<u8> {
                Vec::new()
            }
        }
        let addr = resolve_target(&Plain, "127.0.0.1", 8080).unwrap();
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn test_resolve_target_workload_override() {
        struct Fixed;
        impl Workload for Fixed {
            fn build_request(&self) -> Vec<u8> {
                Vec::new()
            }
            fn resolve(&self, _host: &str, _port: u16) -> Option<Vec<SocketAddr>> {
                Some(vec!["10.0.0.1:9999".parse().unwrap()])
            }
        }
        let addr = resolve_target(&Fixed, "whatever", 1).unwrap();
        assert_eq!(addr, "10.0.0.1:9999".parse().unwrap());
    }
}
