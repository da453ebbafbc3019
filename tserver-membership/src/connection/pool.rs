use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::PoolConfig;
use crate::connection::client::{ClientFactory, TabletClient};
use crate::error::RpcError;
use crate::server_instance::HostAndPort;

struct IdleClient {
    client: Box<dyn TabletClient>,
    returned_at: Instant,
}

/// Per-address LIFO pool of open tablet server clients.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    factory: Arc<dyn ClientFactory>,
    idle: Mutex<HashMap<HostAndPort, Vec<IdleClient>>>,
    max_idle_per_address: usize,
    idle_timeout: Duration,
}

impl Debug for ConnectionPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("max_idle_per_address", &self.inner.max_idle_per_address)
            .field("idle_timeout", &self.inner.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn ClientFactory>, config: &PoolConfig) -> Self {
        let inner = PoolInner {
            factory,
            idle: Mutex::new(HashMap::new()),
            max_idle_per_address: config.max_idle_per_address,
            idle_timeout: config.idle_timeout.to_std_duration(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Reuses an idle client or opens a new one. The client goes back to the
    /// pool when the returned guard is dropped after [`PooledClient::complete`].
    pub async fn acquire(&self, address: &HostAndPort) -> Result<PooledClient, RpcError> {
        let client = match self.take_idle(address) {
            Some(client) => client,
            None => {
                trace!("open pooled connection to {}", address);
                self.inner.factory.connect(address).await?
            }
        };
        Ok(PooledClient {
            client: Some(client),
            address: address.clone(),
            pool: self.clone(),
            completed: false,
        })
    }

    /// A client that bypasses the pool and is closed once dropped.
    pub async fn transient(&self, address: &HostAndPort) -> Result<Box<dyn TabletClient>, RpcError> {
        trace!("open transient connection to {}", address);
        self.inner.factory.connect(address).await
    }

    pub fn idle_count(&self, address: &HostAndPort) -> usize {
        self.inner.idle.lock().get(address).map_or(0, |idle| idle.len())
    }

    pub fn clear(&self) {
        self.inner.idle.lock().clear();
    }

    fn take_idle(&self, address: &HostAndPort) -> Option<Box<dyn TabletClient>> {
        let mut idle = self.inner.idle.lock();
        let clients = idle.get_mut(address)?;
        while let Some(IdleClient { client, returned_at }) = clients.pop() {
            if returned_at.elapsed() <= self.inner.idle_timeout && client.is_open() {
                return Some(client);
            }
            debug!("discard stale pooled connection to {}", address);
        }
        idle.remove(address);
        None
    }

    fn release(&self, address: &HostAndPort, client: Box<dyn TabletClient>) {
        if !client.is_open() {
            debug!("drop closed connection to {}", address);
            return;
        }
        let mut idle = self.inner.idle.lock();
        let clients = idle.entry(address.clone()).or_insert_with(Vec::new);
        if clients.len() < self.inner.max_idle_per_address {
            clients.push(IdleClient {
                client,
                returned_at: Instant::now(),
            });
        }
    }
}

/// A pooled client on loan. Returned to its pool on drop only once the call it
/// carried has run to completion; a loan dropped mid-call closes the client.
pub struct PooledClient {
    client: Option<Box<dyn TabletClient>>,
    address: HostAndPort,
    pool: ConnectionPool,
    completed: bool,
}

impl PooledClient {
    /// Marks the last call as finished, whatever its outcome.
    pub fn complete(&mut self) {
        self.completed = true;
    }
}

impl Debug for PooledClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledClient")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Deref for PooledClient {
    type Target = dyn TabletClient;

    fn deref(&self) -> &Self::Target {
        self.client.as_deref().expect("pooled client is present until dropped")
    }
}

impl DerefMut for PooledClient {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.client.as_deref_mut().expect("pooled client is present until dropped")
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            if self.completed {
                self.pool.release(&self.address, client);
            } else {
                debug!("discard connection to {} after an unfinished call", self.address);
            }
        }
    }
}
