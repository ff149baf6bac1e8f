//! The transport under a pooled slot and the factory that opens it.

use std::time::Duration;

use kvpool_core::{BackendSettings, ResourceType};

use crate::redis::RedisConnectionFactory;
use crate::tcp::TcpConnectionFactory;

/// An open transport to a key/value backend.
///
/// The pool never parses what flows over it; callers speak the backend's
/// wire protocol through `send`/`recv`.
pub trait ConnectionBackend: Send + std::fmt::Debug {
    /// Send bytes over the connection. Returns bytes sent.
    fn send(&mut self, data: &[u8]) -> Result<usize, String>;
    /// Receive up to `max_bytes` from the connection.
    fn recv(&mut self, max_bytes: usize) -> Result<Vec<u8>, String>;
    /// Cheap liveness check used before handing out a warm connection.
    fn is_open(&self) -> bool;
    /// Close the underlying transport.
    fn close(&mut self);
}

/// Opens backend connections from resolved settings.
///
/// Called from a blocking thread, so implementations may block on I/O.
pub trait ConnectionFactory: Send + Sync {
    fn connect(
        &self,
        ty: ResourceType,
        settings: &BackendSettings,
    ) -> Result<Box<dyn ConnectionBackend>, String>;
}

/// Routes each resource type to its wire-level factory.
///
/// Redis connections perform `AUTH`/`SELECT` during open; MongoDB
/// connections are plain TCP passthrough.
pub struct BackendFactory {
    tcp: TcpConnectionFactory,
    redis: RedisConnectionFactory,
}

impl BackendFactory {
    pub fn new(recv_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            tcp: TcpConnectionFactory::new(recv_timeout, connect_timeout),
            redis: RedisConnectionFactory::new(recv_timeout, connect_timeout),
        }
    }
}

impl Default for BackendFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(5))
    }
}

impl ConnectionFactory for BackendFactory {
    fn connect(
        &self,
        ty: ResourceType,
        settings: &BackendSettings,
    ) -> Result<Box<dyn ConnectionBackend>, String> {
        match ty {
            ResourceType::Redis => self.redis.connect(ty, settings),
            ResourceType::MongoDb => self.tcp.connect(ty, settings),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn mongodb_routes_to_plain_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let settings = BackendSettings {
            database_name: Some("app".to_string()),
            port: Some(port),
            ..BackendSettings::default()
        };

        let factory = BackendFactory::default();
        let backend = factory.connect(ResourceType::MongoDb, &settings).unwrap();
        assert!(backend.is_open());
    }

    #[test]
    fn unreachable_backend_fails() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let settings = BackendSettings {
            port: Some(port),
            ..BackendSettings::default()
        };

        let factory = BackendFactory::new(Duration::from_secs(1), Duration::from_millis(200));
        let err = factory.connect(ResourceType::Redis, &settings).unwrap_err();
        assert!(err.contains("tcp connect"));
    }
}
