use mio::{Interest, Registry, Token};
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

pub mod tcp;

pub use tcp::TcpConnector;

/// Transport-level failures.
///
/// All of these are per-connection recoverable: the owning worker counts
/// them and reconnects the one affected connection. None of them abort
/// the run.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    #[error("event registration failed: {0}")]
    Register(#[source] io::Error),
}

/// Outcome of a non-blocking read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// The operation transferred this many bytes.
    Done(usize),
    /// The operation would block; retry when the channel signals readiness.
    Retry,
    /// The peer closed the channel (end of stream on read).
    Closed,
}

/// One non-blocking byte-stream channel.
///
/// Every operation must be non-blocking: an operation that cannot make
/// progress returns [`IoOutcome::Retry`] instead of suspending the
/// calling thread. The event loop is the only place a worker thread is
/// allowed to block.
pub trait Channel: Send {
    /// Read available bytes into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> Result<IoOutcome, TransportError>;

    /// Write bytes from `buf`; may transfer fewer than `buf.len()`.
    fn write(&mut self, buf: &[u8]) -> Result<IoOutcome, TransportError>;

    /// Hint: whether a read is likely to make progress right now.
    fn readable(&self) -> bool {
        true
    }

    /// Check whether an in-progress asynchronous connect has finished.
    ///
    /// Returns `Ok(true)` once the channel is usable, `Ok(false)` while
    /// the connect is still pending, and an error if the connect failed.
    fn connect_ready(&mut self) -> Result<bool, TransportError>;

    /// Register this channel with the worker's readiness poller.
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> Result<(), TransportError>;

    /// Change the readiness interest set.
    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> Result<(), TransportError>;

    /// Remove this channel from the poller before closing.
    fn deregister(&mut self, registry: &Registry) -> Result<(), TransportError>;
}

/// Factory for channels of one backend, selected once at startup.
///
/// The core holds a single connector by reference for the whole run and
/// never dispatches through mutable global state; interchangeable
/// backends (plain TCP today, TLS or a user-space channel behind the
/// same trait) are invisible to the state machine.
pub trait Connector: Send + Sync {
    /// Begin a non-blocking connect to `remote`, optionally binding
    /// `local` first. The returned channel is not usable until
    /// [`Channel::connect_ready`] reports true.
    fn connect(
        &self,
        local: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> Result<Box<dyn Channel>, TransportError>;

    /// Backend name for logs and the report.
    fn name(&self) -> &'static str;
}
