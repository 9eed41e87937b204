use super::{Channel, Connector, IoOutcome, TransportError};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;

/// Plain TCP backend.
///
/// Sockets are created non-blocking with `TCP_NODELAY` set, so a small
/// request is never held back by Nagle while the schedule expects it on
/// the wire.
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        local: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> Result<Box<dyn Channel>, TransportError> {
        let socket = Socket::new(
            Domain::for_address(remote),
            Type::STREAM,
            Some(Protocol::TCP),
        )
        .map_err(TransportError::Connect)?;
        socket.set_nonblocking(true).map_err(TransportError::Connect)?;
        socket.set_nodelay(true).map_err(TransportError::Connect)?;
        if let Some(local) = local {
            socket.bind(&local.into()).map_err(TransportError::Connect)?;
        }

        // A non-blocking connect reports EINPROGRESS; completion shows up
        // as the socket becoming writable.
        match socket.connect(&remote.into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(TransportError::Connect(e)),
        }

        let stream = TcpStream::from_std(socket.into());
        Ok(Box::new(TcpChannel {
            stream,
            connected: false,
        }))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// One established (or connecting) TCP stream.
pub struct TcpChannel {
    stream: TcpStream,
    connected: bool,
}

impl Channel for TcpChannel {
    fn read(&mut self, buf: &mut [u8]) -> Result<IoOutcome, TransportError> {
        loop {
            match self.stream.read(buf) {
                Ok(0) => return Ok(IoOutcome::Closed),
                Ok(n) => return Ok(IoOutcome::Done(n)),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(IoOutcome::Retry),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Read(e)),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<IoOutcome, TransportError> {
        loop {
            match self.stream.write(buf) {
                Ok(0) => {
                    return Err(TransportError::Write(io::Error::new(
                        ErrorKind::WriteZero,
                        "connection closed during write",
                    )))
                }
                Ok(n) => return Ok(IoOutcome::Done(n)),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(IoOutcome::Retry),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Write(e)),
            }
        }
    }

    fn readable(&self) -> bool {
        // Hint only: a one-byte peek tells us whether data is queued
        // without consuming it.
        let mut probe = [0u8; 1];
        matches!(self.stream.peek(&mut probe), Ok(n) if n > 0)
    }

    fn connect_ready(&mut self) -> Result<bool, TransportError> {
        if self.connected {
            return Ok(true);
        }
        // After a writable event, a pending SO_ERROR means the connect
        // failed; an unconnected peer address means it is still pending.
        match self.stream.take_error() {
            Ok(Some(e)) | Err(e) => return Err(TransportError::Connect(e)),
            Ok(None) => {}
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.connected = true;
                Ok(true)
            }
            Err(ref e)
                if e.kind() == ErrorKind::NotConnected
                    || e.raw_os_error() == Some(libc::EINPROGRESS) =>
            {
                Ok(false)
            }
            Err(e) => Err(TransportError::Connect(e)),
        }
    }

    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> Result<(), TransportError> {
        registry
            .register(&mut self.stream, token, interest)
            .map_err(TransportError::Register)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> Result<(), TransportError> {
        registry
            .reregister(&mut self.stream, token, interest)
            .map_err(TransportError::Register)
    }

    fn deregister(&mut self, registry: &Registry) -> Result<(), TransportError> {
        registry
            .deregister(&mut self.stream)
            .map_err(TransportError::Register)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_connect_and_write_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let connector = TcpConnector::new();
        let mut channel = connector.connect(None, addr).unwrap();

        let (mut server_side, _) = listener.accept().unwrap();

        // Poll connect completion; localhost connects settle quickly.
        let mut ready = false;
        for _ in 0..200 {
            if channel.connect_ready().unwrap() {
                ready = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(ready, "localhost connect did not complete");

        match channel.write(b"ping").unwrap() {
            IoOutcome::Done(n) => assert_eq!(n, 4),
            other => panic!("unexpected write outcome: {:?}", other),
        }

        let mut received = [0u8; 4];
        server_side.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"ping");

        server_side.write_all(b"pong").unwrap();
        drop(server_side);

        // Drain until we observe the payload, then EOF.
        let mut collected = Vec::new();
        let mut buf = [0u8; 16];
        for _ in 0..200 {
            match channel.read(&mut buf).unwrap() {
                IoOutcome::Done(n) => collected.extend_from_slice(&buf[..n]),
                IoOutcome::Closed => break,
                IoOutcome::Retry => std::thread::sleep(std::time::Duration::from_millis(1)),
            }
        }
        assert_eq!(collected, b"pong");
    }

    #[test]
    fn test_connect_refused_surfaces_as_error() {
        // Bind then drop to find a port with no listener.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = TcpConnector::new();
        // The failure may surface at connect() or at connect_ready().
        match connector.connect(None, addr) {
            Err(TransportError::Connect(_)) => {}
            Ok(mut channel) => {
                let mut failed = false;
                for _ in 0..200 {
                    match channel.connect_ready() {
                        Ok(true) => break,
                        Ok(false) => {
                            std::thread::sleep(std::time::Duration::from_millis(1))
                        }
                        Err(_) => {
                            failed = true;
                            break;
                        }
                    }
                }
                assert!(failed, "connect to dead port should fail");
            }
            Err(other) => panic!("unexpected error variant: {:?}", other),
        }
    }
}
