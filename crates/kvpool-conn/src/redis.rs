//! Redis connection factory.
//!
//! Opens a plain TCP connection, then authenticates and selects the
//! configured logical database before handing the connection to the pool.
//! Commands are encoded as RESP arrays of bulk strings.

use std::time::Duration;

use kvpool_core::{BackendSettings, ResourceType};

use crate::backend::{ConnectionBackend, ConnectionFactory};
use crate::tcp::{TcpBackend, TcpConnectionFactory};

/// Factory for Redis connections with an `AUTH`/`SELECT` handshake.
pub struct RedisConnectionFactory {
    tcp: TcpConnectionFactory,
}

impl RedisConnectionFactory {
    pub fn new(recv_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            tcp: TcpConnectionFactory::new(recv_timeout, connect_timeout),
        }
    }
}

impl ConnectionFactory for RedisConnectionFactory {
    fn connect(
        &self,
        ty: ResourceType,
        settings: &BackendSettings,
    ) -> Result<Box<dyn ConnectionBackend>, String> {
        let mut backend = self.tcp.connect_tcp(ty, settings)?;

        if let Some(password) = settings.password.as_deref() {
            let cmd = match settings.user_name.as_deref() {
                Some(user) => encode_command(&["AUTH", user, password]),
                None => encode_command(&["AUTH", password]),
            };
            expect_ok(&mut backend, &cmd, "AUTH")?;
        }

        if let Some(db) = logical_database(settings) {
            let index = db.to_string();
            expect_ok(&mut backend, &encode_command(&["SELECT", &index]), "SELECT")?;
        }

        tracing::debug!(addr = %settings.address(ty), "redis handshake complete");
        Ok(Box::new(backend))
    }
}

/// Numeric, non-zero `database_name` selects a logical database.
fn logical_database(settings: &BackendSettings) -> Option<u32> {
    settings
        .database_name
        .as_deref()
        .and_then(|name| name.parse::<u32>().ok())
        .filter(|index| *index > 0)
}

/// Encode a command as a RESP array of bulk strings.
fn encode_command(args: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn expect_ok(backend: &mut TcpBackend, cmd: &[u8], label: &str) -> Result<(), String> {
    backend.send(cmd)?;
    let reply = read_line(backend)?;
    if reply == "+OK" {
        Ok(())
    } else {
        Err(format!("redis {label} rejected: {reply}"))
    }
}

/// Read a single CRLF-terminated reply line.
fn read_line(backend: &mut TcpBackend) -> Result<String, String> {
    let mut line = Vec::new();
    while !line.ends_with(b"\r\n") {
        let chunk = backend.recv(1)?;
        if chunk.is_empty() {
            return Err("redis closed the connection during handshake".to_string());
        }
        line.extend_from_slice(&chunk);
    }
    line.truncate(line.len() - 2);
    Ok(String::from_utf8_lossy(&line).into_owned())
}
