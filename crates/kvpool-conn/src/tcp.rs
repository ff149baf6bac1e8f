//! TCP connection backend for key/value wire protocol passthrough.
//!
//! [`TcpBackend`] implements [`ConnectionBackend`] over a plain TCP stream
//! and performs no protocol parsing. [`TcpConnectionFactory`] resolves the
//! configured host, connects with a timeout and applies the read timeout.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use kvpool_core::{BackendSettings, ResourceType};

use crate::backend::{ConnectionBackend, ConnectionFactory};

// ── TcpBackend ───────────────────────────────────────────────────────

/// A [`ConnectionBackend`] writing and reading raw bytes on a TCP stream.
pub struct TcpBackend {
    stream: TcpStream,
    closed: bool,
}

impl std::fmt::Debug for TcpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpBackend")
            .field("peer", &self.stream.peer_addr().ok())
            .field("closed", &self.closed)
            .finish()
    }
}

impl TcpBackend {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

impl ConnectionBackend for TcpBackend {
    fn send(&mut self, data: &[u8]) -> Result<usize, String> {
        if self.closed {
            return Err("tcp send: connection closed".to_string());
        }
        self.stream
            .write_all(data)
            .map_err(|e| format!("tcp send: {e}"))?;
        Ok(data.len())
    }

    fn recv(&mut self, max_bytes: usize) -> Result<Vec<u8>, String> {
        if self.closed {
            return Err("tcp recv: connection closed".to_string());
        }
        let mut buf = vec![0u8; max_bytes];
        let n = self
            .stream
            .read(&mut buf)
            .map_err(|e| format!("tcp recv: {e}"))?;
        buf.truncate(n);
        Ok(buf)
    }

    fn is_open(&self) -> bool {
        if self.closed {
            return false;
        }

        // Non-blocking peek: EOF means the peer hung up, WouldBlock means
        // the socket is idle but alive.
        if self.stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut peek_buf = [0u8; 1];
        let alive = match self.stream.peek(&mut peek_buf) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) => e.kind() == std::io::ErrorKind::WouldBlock,
        };
        let _ = self.stream.set_nonblocking(false);
        alive
    }

    fn close(&mut self) {
        if !self.closed {
            let _ = self.stream.shutdown(Shutdown::Both);
            self.closed = true;
        }
    }
}

// ── ConnectOptions ───────────────────────────────────────────────────

/// Socket options parsed from a `connect_options` string.
///
/// The string is a `;`-separated list of `key=value` pairs, e.g.
/// `connect_timeout_ms=500;recv_timeout_ms=2000;nodelay=false`.
/// Unsupported or malformed entries are logged and skipped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    pub connect_timeout: Option<Duration>,
    pub recv_timeout: Option<Duration>,
    pub nodelay: Option<bool>,
}

impl ConnectOptions {
    pub fn parse(raw: &str) -> Self {
        let mut options = Self::default();
        for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (key, value) = entry
                .split_once('=')
                .map_or((entry, ""), |(k, v)| (k.trim(), v.trim()));
            let applied = match key.to_ascii_lowercase().as_str() {
                "connect_timeout_ms" => value
                    .parse()
                    .map(|ms| options.connect_timeout = Some(Duration::from_millis(ms)))
                    .is_ok(),
                "recv_timeout_ms" => value
                    .parse()
                    .map(|ms| options.recv_timeout = Some(Duration::from_millis(ms)))
                    .is_ok(),
                "nodelay" => value
                    .parse()
                    .map(|on| options.nodelay = Some(on))
                    .is_ok(),
                _ => false,
            };
            if !applied {
                tracing::warn!(option = entry, "ignoring unsupported connect option");
            }
        }
        options
    }
}

// ── TcpConnectionFactory ─────────────────────────────────────────────

/// Factory creating plain TCP connections to a backend.
///
/// Performs no protocol handshake; see
/// [`RedisConnectionFactory`](crate::redis::RedisConnectionFactory) for one that does.
pub struct TcpConnectionFactory {
    /// Timeout for recv (read) operations on created connections.
    recv_timeout: Duration,
    /// Timeout for establishing TCP connections.
    connect_timeout: Duration,
}

impl TcpConnectionFactory {
    pub fn new(recv_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            recv_timeout,
            connect_timeout,
        }
    }

    /// Connect and return the concrete backend, for factories layering a handshake on top.
    pub fn connect_tcp(
        &self,
        ty: ResourceType,
        settings: &BackendSettings,
    ) -> Result<TcpBackend, String> {
        let addr_str = settings.address(ty);
        let addr = addr_str
            .to_socket_addrs()
            .map_err(|e| format!("dns resolution failed for {addr_str}: {e}"))?
            .next()
            .ok_or_else(|| format!("no address found for {addr_str}"))?;

        let options = settings
            .connect_options
            .as_deref()
            .map(ConnectOptions::parse)
            .unwrap_or_default();

        let connect_timeout = options.connect_timeout.unwrap_or(self.connect_timeout);
        let stream = TcpStream::connect_timeout(&addr, connect_timeout)
            .map_err(|e| format!("tcp connect to {addr_str}: {e}"))?;
        stream
            .set_read_timeout(Some(options.recv_timeout.unwrap_or(self.recv_timeout)))
            .map_err(|e| format!("set recv timeout: {e}"))?;
        // Nagle is off by default for request/response traffic.
        let _ = stream.set_nodelay(options.nodelay.unwrap_or(true));

        tracing::debug!(%ty, addr = %addr_str, "established tcp connection");
        Ok(TcpBackend::new(stream))
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    fn connect(
        &self,
        ty: ResourceType,
        settings: &BackendSettings,
    ) -> Result<Box<dyn ConnectionBackend>, String> {
        Ok(Box::new(self.connect_tcp(ty, settings)?))
    }
}
