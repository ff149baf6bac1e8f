//! Request handler relaying client bytes to a pooled backend connection.
//!
//! Each inbound connection borrows one backend connection for its whole
//! lifetime. Every chunk read from the client is forwarded to the backend
//! and the backend's reply is written back. With no backend configured the
//! handler echoes the client's bytes.

use std::sync::Arc;

use anyhow::Context;
use kvpool_conn::{ConnectionPool, PooledConnection};
use kvpool_core::ResourceType;
use kvpool_dispatch::{RequestHandler, WorkerContext};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const CHUNK_SIZE: usize = 16 * 1024;

pub struct BackendRelay {
    pool: Arc<ConnectionPool>,
    target: Option<ResourceType>,
}

impl BackendRelay {
    /// Relay to Redis when available, else MongoDB, else echo.
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        let target = [ResourceType::Redis, ResourceType::MongoDb]
            .into_iter()
            .find(|ty| pool.is_available(*ty));
        Self { pool, target }
    }

    pub fn target(&self) -> Option<ResourceType> {
        self.target
    }
}

/// Forward one chunk and read the reply on the blocking pool.
async fn round_trip(
    mut conn: PooledConnection,
    request: Vec<u8>,
) -> anyhow::Result<(PooledConnection, Vec<u8>)> {
    tokio::task::spawn_blocking(move || {
        match conn.send(&request).and_then(|_| conn.recv(CHUNK_SIZE)) {
            Ok(reply) => Ok((conn, reply)),
            Err(e) => {
                // A late reply may still arrive; the slot must be reopened.
                if let Ok(backend) = conn.backend_mut() {
                    backend.close();
                }
                Err(anyhow::Error::msg(e))
            }
        }
    })
    .await
    .context("backend round trip task failed")?
}

impl RequestHandler for BackendRelay {
    async fn handle(&self, mut stream: TcpStream, ctx: WorkerContext) -> anyhow::Result<()> {
        let mut conn = match self.target {
            Some(ty) => Some(self.pool.acquire(ty).await?),
            None => None,
        };
        debug!(
            worker = ctx.worker_id,
            backend = conn.as_ref().map(|c| c.name()),
            "serving connection"
        );

        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            let reply = match conn.take() {
                Some(held) => {
                    let (held, reply) = round_trip(held, buf[..n].to_vec())
                        .await
                        .with_context(|| format!("relay to {:?} failed", self.target))?;
                    conn = Some(held);
                    reply
                }
                None => buf[..n].to_vec(),
            };
            stream.write_all(&reply).await?;
        }

        if let Some(held) = conn {
            self.pool.release(held);
        }
        Ok(())
    }
}
