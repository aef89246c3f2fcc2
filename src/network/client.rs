//! Network Client
//!
//! Pooled TCP client for request/response exchanges with peers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

use super::{read_message, write_message};
use crate::error::{Error, Result};
use crate::replication::Message;

/// Connection pool entry
struct PoolEntry {
    stream: TcpStream,
    last_used: Instant,
}

/// Network client for connecting to peer nodes
pub struct NetworkClient {
    /// Connection pool: address -> idle connections
    pool: RwLock<HashMap<String, Vec<Arc<Mutex<PoolEntry>>>>>,
    /// Connection timeout
    connect_timeout: Duration,
    /// Request timeout
    request_timeout: Duration,
    /// Max idle connections kept per peer
    max_connections: usize,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            pool: RwLock::new(HashMap::new()),
            connect_timeout,
            request_timeout,
            max_connections: 8,
        }
    }

    /// Send a message to a peer and wait for response
    pub async fn send(&self, address: &str, message: Message) -> Result<Message> {
        match timeout(self.request_timeout, self.send_inner(address, &message)).await {
            Ok(inner_result) => inner_result,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    async fn send_inner(&self, address: &str, message: &Message) -> Result<Message> {
        // A pooled connection may have been closed by the peer; fall through to a fresh one
        if let Some(entry) = self.checkout(address).await {
            let exchanged = {
                let mut guard = entry.lock().await;
                let (mut reader, mut writer) = guard.stream.split();
                match write_message(&mut writer, message).await {
                    Ok(()) => read_message(&mut reader).await,
                    Err(e) => Err(e),
                }
            };
            match exchanged {
                Ok(response) => {
                    self.checkin(address, entry).await;
                    return Ok(response);
                }
                Err(e) => {
                    tracing::debug!("Pooled connection to {} failed: {}", address, e);
                }
            }
        }

        let mut stream = self.connect(address).await?;
        let response = {
            let (mut reader, mut writer) = stream.split();
            write_message(&mut writer, message).await?;
            read_message(&mut reader).await?
        };
        self.checkin(
            address,
            Arc::new(Mutex::new(PoolEntry {
                stream,
                last_used: Instant::now(),
            })),
        )
        .await;
        Ok(response)
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Take an idle connection out of the pool
    async fn checkout(&self, address: &str) -> Option<Arc<Mutex<PoolEntry>>> {
        let mut pool = self.pool.write().await;
        pool.get_mut(address).and_then(|idle| idle.pop())
    }

    /// Return a connection to the pool
    async fn checkin(&self, address: &str, entry: Arc<Mutex<PoolEntry>>) {
        if let Ok(mut guard) = entry.try_lock() {
            guard.last_used = Instant::now();
        }
        let mut pool = self.pool.write().await;
        let idle = pool.entry(address.to_string()).or_default();
        if idle.len() < self.max_connections {
            idle.push(entry);
        }
    }

    /// Clean up stale connections
    pub async fn cleanup_stale(&self, max_idle: Duration) {
        let mut pool = self.pool.write().await;
        let now = Instant::now();

        for (addr, idle) in pool.iter_mut() {
            idle.retain(|entry| match entry.try_lock() {
                Ok(e) if now.duration_since(e.last_used) > max_idle => {
                    tracing::debug!("Removing stale connection to {}", addr);
                    false
                }
                _ => true,
            });
        }
        pool.retain(|_, idle| !idle.is_empty());
    }

    /// Close all connections
    pub async fn close_all(&self) {
        self.pool.write().await.clear();
    }

    /// Get idle connection count
    pub async fn connection_count(&self) -> usize {
        self.pool.read().await.values().map(Vec::len).sum()
    }
}
