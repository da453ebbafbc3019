use std::fmt::{Debug, Formatter};
use std::time::SystemTime;

use tokio::time::Instant;
use tracing::trace;

use crate::connection::client::{KeyExtent, ManagerLockToken, TabletServerStatus, UnloadGoal};
use crate::connection::pool::ConnectionPool;
use crate::error::RpcError;
use crate::server_instance::HostAndPort;

pub mod client;
pub mod pool;

/// Handle for issuing management calls to one live tablet server. Holds no
/// open transport of its own; every call borrows one from the pool or opens
/// a transient one.
#[derive(Clone)]
pub struct TServerConnection {
    address: HostAndPort,
    pool: ConnectionPool,
}

impl Debug for TServerConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TServerConnection")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl TServerConnection {
    pub fn new(address: HostAndPort, pool: ConnectionPool) -> Self {
        Self { address, pool }
    }

    pub fn address(&self) -> &HostAndPort {
        &self.address
    }

    /// Metadata tablets are loaded over a dedicated connection so they never
    /// wait behind pooled traffic.
    pub async fn assign_tablet(&self, lock: &ManagerLockToken, extent: &KeyExtent) -> Result<(), RpcError> {
        trace!("assign {} to {}", extent, self.address);
        if extent.is_metadata() {
            let mut client = self.pool.transient(&self.address).await?;
            client.load_tablet(lock, extent).await
        } else {
            let mut client = self.pool.acquire(&self.address).await?;
            let result = client.load_tablet(lock, extent).await;
            client.complete();
            result
        }
    }

    pub async fn unassign_tablet(
        &self,
        lock: &ManagerLockToken,
        extent: &KeyExtent,
        goal: UnloadGoal,
        request_time: SystemTime,
    ) -> Result<(), RpcError> {
        trace!("unassign {} from {} with goal {:?}", extent, self.address, goal);
        let mut client = self.pool.acquire(&self.address).await?;
        let result = client.unload_tablet(lock, extent, goal, request_time).await;
        client.complete();
        result
    }

    /// Fetches the server's status, recording the observed round trip in
    /// [`TabletServerStatus::response_time`].
    pub async fn get_status(&self, lock: &ManagerLockToken, pooled: bool) -> Result<TabletServerStatus, RpcError> {
        let start = Instant::now();
        let mut status = if pooled {
            let mut client = self.pool.acquire(&self.address).await?;
            let result = client.get_tablet_server_status(lock).await;
            client.complete();
            result?
        } else {
            let mut client = self.pool.transient(&self.address).await?;
            client.get_tablet_server_status(lock).await?
        };
        status.response_time = start.elapsed();
        Ok(status)
    }

    pub async fn halt(&self, lock: &ManagerLockToken) -> Result<(), RpcError> {
        let mut client = self.pool.acquire(&self.address).await?;
        let result = client.halt(lock).await;
        client.complete();
        result
    }

    pub async fn fast_halt(&self, lock: &ManagerLockToken) -> Result<(), RpcError> {
        let mut client = self.pool.acquire(&self.address).await?;
        let result = client.fast_halt(lock).await;
        client.complete();
        result
    }

    pub async fn flush(
        &self,
        lock: &ManagerLockToken,
        table_id: &str,
        start_row: Option<&[u8]>,
        end_row: Option<&[u8]>,
    ) -> Result<(), RpcError> {
        let mut client = self.pool.acquire(&self.address).await?;
        let result = client.flush(lock, table_id, start_row, end_row).await;
        client.complete();
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, SystemTime};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::config::PoolConfig;
    use crate::config::duration::ConfigDuration;
    use crate::connection::client::{ClientFactory, KeyExtent, ManagerLockToken, TabletClient, TabletServerStatus, UnloadGoal};
    use crate::connection::pool::ConnectionPool;
    use crate::connection::TServerConnection;
    use crate::error::RpcError;
    use crate::server_instance::HostAndPort;

    /// Records every call and the id of the connection that carried it.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedFactory {
        pub(crate) opened: AtomicUsize,
        pub(crate) calls: Mutex<Vec<(usize, String)>>,
        pub(crate) refuse: AtomicBool,
        pub(crate) close_after_call: AtomicBool,
        pub(crate) status_delay: Mutex<Option<Duration>>,
    }

    #[derive(Debug)]
    struct ScriptedClient {
        id: usize,
        address: HostAndPort,
        factory: Arc<ScriptedFactory>,
        open: bool,
    }

    impl ScriptedClient {
        fn record(&mut self, call: impl Into<String>) {
            self.factory.calls.lock().push((self.id, call.into()));
            if self.factory.close_after_call.load(Ordering::SeqCst) {
                self.open = false;
            }
        }
    }

    #[async_trait]
    impl TabletClient for ScriptedClient {
        async fn load_tablet(&mut self, _lock: &ManagerLockToken, extent: &KeyExtent) -> Result<(), RpcError> {
            self.record(format!("load {}", extent));
            Ok(())
        }

        async fn unload_tablet(&mut self, _lock: &ManagerLockToken, extent: &KeyExtent, goal: UnloadGoal, _request_time: SystemTime) -> Result<(), RpcError> {
            self.record(format!("unload {} {:?}", extent, goal));
            Ok(())
        }

        async fn get_tablet_server_status(&mut self, _lock: &ManagerLockToken) -> Result<TabletServerStatus, RpcError> {
            self.record("status");
            let delay = *self.factory.status_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(TabletServerStatus {
                name: self.address.to_string(),
                ..Default::default()
            })
        }

        async fn halt(&mut self, _lock: &ManagerLockToken) -> Result<(), RpcError> {
            self.record("halt");
            Ok(())
        }

        async fn fast_halt(&mut self, _lock: &ManagerLockToken) -> Result<(), RpcError> {
            self.record("fast_halt");
            Ok(())
        }

        async fn flush(&mut self, _lock: &ManagerLockToken, table_id: &str, _start_row: Option<&[u8]>, _end_row: Option<&[u8]>) -> Result<(), RpcError> {
            self.record(format!("flush {}", table_id));
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    #[async_trait]
    impl ClientFactory for Arc<ScriptedFactory> {
        async fn connect(&self, address: &HostAndPort) -> Result<Box<dyn TabletClient>, RpcError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(RpcError::Connect { address: address.clone(), reason: "connection refused".to_string() });
            }
            let id = self.opened.fetch_add(1, Ordering::SeqCst);
            let client = ScriptedClient {
                id,
                address: address.clone(),
                factory: self.clone(),
                open: true,
            };
            Ok(Box::new(client))
        }
    }

    pub(crate) fn scripted_pool(max_idle: usize) -> (Arc<ScriptedFactory>, ConnectionPool) {
        let factory = Arc::new(ScriptedFactory::default());
        let config = PoolConfig {
            max_idle_per_address: max_idle,
            idle_timeout: ConfigDuration::from_secs(60),
        };
        let pool = ConnectionPool::new(Arc::new(factory.clone()), &config);
        (factory, pool)
    }

    fn lock() -> ManagerLockToken {
        ManagerLockToken {
            path: "/cluster/managers/lock".to_string(),
            session: "1".to_string(),
        }
    }

    fn address() -> HostAndPort {
        HostAndPort::new("tserver-1", 9997)
    }

    #[tokio::test]
    async fn pooled_calls_reuse_one_connection() -> anyhow::Result<()> {
        let (factory, pool) = scripted_pool(4);
        let connection = TServerConnection::new(address(), pool.clone());
        connection.assign_tablet(&lock(), &KeyExtent::new("2", None, None)).await?;
        connection.flush(&lock(), "2", None, None).await?;
        connection.halt(&lock()).await?;
        assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(&address()), 1);
        let ids = factory.calls.lock().iter().map(|(id, _)| *id).collect::<Vec<_>>();
        assert_eq!(ids, vec![0, 0, 0]);
        Ok(())
    }

    #[tokio::test]
    async fn metadata_assignment_uses_transient_connection() -> anyhow::Result<()> {
        let (factory, pool) = scripted_pool(4);
        let connection = TServerConnection::new(address(), pool.clone());
        connection.assign_tablet(&lock(), &KeyExtent::new("!0", None, None)).await?;
        connection.assign_tablet(&lock(), &KeyExtent::new("+r", None, None)).await?;
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_count(&address()), 0);
        Ok(())
    }

    #[tokio::test]
    async fn unpooled_status_does_not_touch_pool() -> anyhow::Result<()> {
        let (factory, pool) = scripted_pool(4);
        let connection = TServerConnection::new(address(), pool.clone());
        let status = connection.get_status(&lock(), false).await?;
        assert_eq!(status.name, "tserver-1:9997");
        assert_eq!(pool.idle_count(&address()), 0);
        connection.get_status(&lock(), true).await?;
        assert_eq!(pool.idle_count(&address()), 1);
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn status_records_response_time() -> anyhow::Result<()> {
        let (factory, pool) = scripted_pool(4);
        *factory.status_delay.lock() = Some(Duration::from_millis(250));
        let connection = TServerConnection::new(address(), pool);
        let status = connection.get_status(&lock(), true).await?;
        assert!(status.response_time >= Duration::from_millis(250));
        Ok(())
    }

    #[tokio::test]
    async fn connect_failure_is_reported_without_retry() {
        let (factory, pool) = scripted_pool(4);
        factory.refuse.store(true, Ordering::SeqCst);
        let connection = TServerConnection::new(address(), pool);
        let error = connection.fast_halt(&lock()).await.unwrap_err();
        assert!(matches!(error, RpcError::Connect { .. }));
        assert!(factory.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn closed_connections_are_not_returned() -> anyhow::Result<()> {
        let (factory, pool) = scripted_pool(4);
        factory.close_after_call.store(true, Ordering::SeqCst);
        let connection = TServerConnection::new(address(), pool.clone());
        connection.unassign_tablet(&lock(), &KeyExtent::new("2", None, None), UnloadGoal::Unassigned, SystemTime::now()).await?;
        connection.halt(&lock()).await?;
        assert_eq!(pool.idle_count(&address()), 0);
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn idle_clients_are_capped_per_address() -> anyhow::Result<()> {
        let (_factory, pool) = scripted_pool(1);
        let mut first = pool.acquire(&address()).await?;
        let mut second = pool.acquire(&address()).await?;
        first.complete();
        second.complete();
        drop(first);
        drop(second);
        assert_eq!(pool.idle_count(&address()), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn expired_idle_clients_are_discarded() -> anyhow::Result<()> {
        let (factory, pool) = scripted_pool(4);
        pool.acquire(&address()).await?.complete();
        tokio::time::advance(Duration::from_secs(61)).await;
        pool.acquire(&address()).await?.complete();
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_count(&address()), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_call_does_not_return_connection() -> anyhow::Result<()> {
        let (factory, pool) = scripted_pool(4);
        *factory.status_delay.lock() = Some(Duration::from_secs(10));
        let connection = TServerConnection::new(address(), pool.clone());
        let status = tokio::time::timeout(Duration::from_secs(1), connection.get_status(&lock(), true)).await;
        assert!(status.is_err());
        assert_eq!(pool.idle_count(&address()), 0);
        *factory.status_delay.lock() = None;
        connection.halt(&lock()).await?;
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_count(&address()), 1);
        Ok(())
    }

    #[tokio::test]
    async fn unfinished_loan_is_discarded() -> anyhow::Result<()> {
        let (_factory, pool) = scripted_pool(4);
        drop(pool.acquire(&address()).await?);
        assert_eq!(pool.idle_count(&address()), 0);
        Ok(())
    }
}
