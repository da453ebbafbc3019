use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::HashSet;
use anyhow::bail;
use arc_swap::ArcSwapOption;
use itertools::Itertools;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::MembershipConfig;
use crate::connection::client::ClientFactory;
use crate::connection::pool::ConnectionPool;
use crate::connection::TServerConnection;
use crate::coordination::CoordinationClient;
use crate::error::{CoordinationError, FatalRemoveError, ParseAddressError};
use crate::listener::{Listener, MembershipDelta};
use crate::live_server_set::watch::{reconcile_loop, scan_ticker, watch_loop};
use crate::server_instance::{InstanceLookup, ServerInstance};
use crate::server_path::{ServerPath, ServerPathParser};
use crate::snapshot::{MemberInfo, MembershipSnapshot};
use crate::stale_tracker::{Observation, StalePathTracker};

mod watch;

/// The manager's view of which tablet servers are alive.
///
/// Members are the server paths whose lock currently has a holder. The view is
/// reconciled against the coordination namespace by full scans (at start and on
/// a fixed period) and by single-path checks driven by watch events. All of
/// them, together with the public mutating calls, serialize on one lock, and
/// every pass reports its net change to the listener exactly once.
#[derive(Clone)]
pub struct LiveServerSet {
    inner: Arc<Inner>,
}

pub struct Inner {
    pub settings: MembershipConfig,
    parser: ServerPathParser,
    coordinator: Arc<dyn CoordinationClient>,
    pool: ConnectionPool,
    listener: Box<dyn Listener>,
    state: tokio::sync::Mutex<State>,
    snapshot: ArcSwapOption<MembershipSnapshot>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug)]
struct State {
    current: BTreeMap<ServerPath, MemberInfo>,
    stale: StalePathTracker,
}

impl Deref for LiveServerSet {
    type Target = Inner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Debug for LiveServerSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveServerSet")
            .field("root", &self.parser.root())
            .field("coordinator", &self.coordinator)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl LiveServerSet {
    pub fn new<L>(
        settings: MembershipConfig,
        coordinator: Arc<dyn CoordinationClient>,
        factory: Arc<dyn ClientFactory>,
        listener: L,
    ) -> Self where L: Listener {
        let parser = ServerPathParser::new(coordinator.root());
        let pool = ConnectionPool::new(factory, &settings.pool);
        let stale = StalePathTracker::new(settings.stale_grace_period.to_std_duration());
        let inner = Inner {
            settings,
            parser,
            coordinator,
            pool,
            listener: Box::new(listener),
            state: tokio::sync::Mutex::new(State { current: BTreeMap::new(), stale }),
            snapshot: ArcSwapOption::empty(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(vec![]),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Runs the first full scan, then starts the watch consumer and the
    /// recurring scan. A failed first scan is logged and left to the next tick.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.settings.validate()?;
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("cannot start live server set more than once");
        }
        if let Err(error) = self.scan_servers().await {
            error!("initial scan of server namespace {} failed: {}", self.parser.root(), error);
        }
        let (tx, rx) = mpsc::channel(self.settings.reconcile_queue_capacity.max(1));
        let scan_interval = self.settings.scan_interval.to_std_duration();
        let retry_delay = self.settings.watch_retry_delay.to_std_duration();
        let reconcile = tokio::spawn(reconcile_loop(Arc::downgrade(&self.inner), rx));
        let watch = tokio::spawn(watch_loop(self.coordinator.clone(), self.parser.clone(), tx.clone(), retry_delay));
        let ticker = tokio::spawn(scan_ticker(tx, scan_interval));
        self.tasks.lock().extend([reconcile, watch, ticker]);
        info!("tracking tablet servers under {}, full scan every {:?}", self.parser.root(), scan_interval);
        Ok(())
    }

    /// Stops the recurring scan, the watch consumer and the reconcile task.
    pub fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if !tasks.is_empty() {
            for task in tasks {
                task.abort();
            }
            info!("stopped tracking tablet servers under {}", self.parser.root());
        }
    }

    /// Full reconciliation pass over every server path in every resource group.
    ///
    /// The listener receives everything the pass changed, also when the pass
    /// stopped on an error part way through.
    pub async fn scan_servers(&self) -> Result<MembershipDelta, CoordinationError> {
        let mut state = self.state.lock().await;
        let mut delta = MembershipDelta::default();
        let result = self.scan_locked(&mut state, &mut delta).await;
        self.listener.update(&delta).await;
        result.map(|_| delta)
    }

    /// Single-path pass for one server path, as driven by a watch event.
    pub async fn check_path(&self, path: &ServerPath) -> Result<MembershipDelta, CoordinationError> {
        let mut state = self.state.lock().await;
        let mut delta = MembershipDelta::default();
        let result = self.check_locked(&mut state, path, false, &mut delta).await;
        self.listener.update(&delta).await;
        result.map(|_| delta)
    }

    pub async fn snapshot(&self) -> Arc<MembershipSnapshot> {
        if let Some(snapshot) = self.snapshot.load_full() {
            return snapshot;
        }
        let state = self.state.lock().await;
        self.snapshot_locked(&state)
    }

    pub async fn current_servers(&self) -> HashSet<ServerInstance> {
        self.snapshot().await.servers().clone()
    }

    pub async fn size(&self) -> usize {
        self.snapshot().await.len()
    }

    pub async fn connection(&self, instance: &ServerInstance) -> Option<TServerConnection> {
        self.snapshot().await.connection(instance).cloned()
    }

    pub async fn resource_group(&self, instance: &ServerInstance) -> Option<String> {
        self.snapshot().await.resource_group(instance).map(str::to_string)
    }

    /// Looks up a member by `host:port` or `host:port[session]`. Without a
    /// session the first match in resource group then address order wins.
    pub async fn find(&self, address: &str) -> Result<Option<ServerInstance>, ParseAddressError> {
        let lookup: InstanceLookup = address.parse()?;
        let state = self.state.lock().await;
        let instance = state
            .current
            .values()
            .find(|member| lookup.matches(&member.instance))
            .map(|member| member.instance.clone());
        Ok(instance)
    }

    /// Evicts `instance` and deletes its whole coordination subtree.
    ///
    /// Unknown instances are ignored. When the namespace does not hold exactly
    /// one matching server path the delete is skipped with an error log. A
    /// failed delete returns [`FatalRemoveError`]: the lock may still look held
    /// to the rest of the cluster, so the caller is expected to terminate.
    pub async fn remove(&self, instance: &ServerInstance) -> Result<(), FatalRemoveError> {
        let mut state = self.state.lock().await;
        let path = state
            .current
            .iter()
            .find(|(_, member)| &member.instance == instance)
            .map(|(path, _)| path.clone());
        let Some(path) = path else {
            debug!("remove of {} ignored, not a live server", instance);
            return Ok(());
        };
        state.current.remove(&path);
        self.snapshot.store(None);
        info!("evict {} from resource group {}", instance, path.group());
        let fatal = |source: CoordinationError| FatalRemoveError {
            instance: instance.clone(),
            path: self.parser.server_key(&path),
            source,
        };
        let candidates = self
            .coordinator
            .list_servers()
            .await
            .map_err(fatal)?
            .into_iter()
            .filter(|candidate| candidate.group() == path.group() && candidate.address() == instance.address())
            .collect::<Vec<_>>();
        let target = match candidates.as_slice() {
            [target] => target,
            _ => {
                error!("expect one server path for {} in resource group {}, found [{}], skip delete", instance, path.group(), candidates.iter().join(", "));
                return Ok(());
            }
        };
        self.coordinator.recursive_delete(target).await.map_err(fatal)?;
        state.stale.forget(target);
        info!("deleted coordination lock {} of {}", self.parser.server_key(target), instance);
        Ok(())
    }

    fn snapshot_locked(&self, state: &State) -> Arc<MembershipSnapshot> {
        if let Some(snapshot) = self.snapshot.load_full() {
            return snapshot;
        }
        let snapshot = Arc::new(MembershipSnapshot::build(state.current.values()));
        trace!("rebuilt membership snapshot with {} servers", snapshot.len());
        self.snapshot.store(Some(snapshot.clone()));
        snapshot
    }

    async fn scan_locked(&self, state: &mut State, delta: &mut MembershipDelta) -> Result<(), CoordinationError> {
        let present = self.coordinator.list_servers().await?;
        state.stale.retain_present(&present);
        let vanished = state
            .current
            .keys()
            .filter(|path| !present.contains(path))
            .cloned()
            .collect::<Vec<_>>();
        for path in vanished {
            if let Some(member) = state.current.remove(&path) {
                info!("server {} vanished with its path {}", member.instance, path);
                self.snapshot.store(None);
                delta.record_removed(member.instance);
            }
        }
        for path in &present {
            self.check_locked(state, path, true, delta).await?;
        }
        Ok(())
    }

    /// `listed` tells whether `path` was just seen in a namespace listing.
    /// Otherwise an unlocked path is only tracked as stale while it still exists.
    async fn check_locked(&self, state: &mut State, path: &ServerPath, listed: bool, delta: &mut MembershipDelta) -> Result<(), CoordinationError> {
        let lock = match self.coordinator.read_lock(path).await {
            Ok(lock) => lock,
            Err(CoordinationError::MalformedLock { key, source }) => {
                warn!("treat {} as unlocked, lock data at {} is malformed: {}", path, key, source);
                None
            }
            Err(error) => return Err(error),
        };
        let Some(lock) = lock else {
            if let Some(member) = state.current.remove(path) {
                info!("server {} lost its lock", member.instance);
                self.snapshot.store(None);
                delta.record_removed(member.instance);
            }
            if !listed && !self.coordinator.exists(path).await? {
                trace!("server path {} is gone", path);
                state.stale.forget(path);
                return Ok(());
            }
            return self.reclaim_stale(state, path).await;
        };
        state.stale.clear(path);
        let instance = lock.instance();
        if let Some(member) = state.current.get_mut(path) {
            if member.instance == instance {
                if member.group != lock.group {
                    member.group = lock.group.clone();
                    self.snapshot.store(None);
                }
                return Ok(());
            }
        }
        if lock.group != path.group() {
            warn!("lock of {} names resource group {}, use the lock's", path, lock.group);
        }
        let member = MemberInfo {
            instance: instance.clone(),
            connection: TServerConnection::new(instance.address().clone(), self.pool.clone()),
            group: lock.group.clone(),
        };
        match state.current.insert(path.clone(), member) {
            Some(previous) => {
                info!("server {} replaced by {} at revision {}", previous.instance, instance, lock.revision);
                delta.record_removed(previous.instance);
            }
            None => {
                info!("server {} joined resource group {}", instance, lock.group);
            }
        }
        self.snapshot.store(None);
        delta.record_added(instance);
        Ok(())
    }

    async fn reclaim_stale(&self, state: &mut State, path: &ServerPath) -> Result<(), CoordinationError> {
        match state.stale.observe(path, Instant::now()) {
            Observation::FirstSeen => {
                debug!("server path {} has no lock holder, delete it after {:?}", path, state.stale.grace_period());
            }
            Observation::Pending(elapsed) => {
                trace!("server path {} unlocked for {:?}", path, elapsed);
            }
            Observation::Expired(elapsed) => {
                match self.coordinator.delete(path).await {
                    Ok(()) => {
                        info!("deleted server path {} after {:?} without a lock holder", path, elapsed);
                    }
                    Err(CoordinationError::NotEmpty(key)) => {
                        debug!("stale server path {} gained children, keep it", key);
                    }
                    Err(error) => return Err(error),
                }
                state.stale.forget(path);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use crate::config::MembershipConfig;
    use crate::config::duration::ConfigDuration;
    use crate::connection::client::ClientFactory;
    use crate::connection::tests::scripted_pool;
    use crate::coordination::CoordinationClient;
    use crate::coordination::memory::MemoryCoordinator;
    use crate::error::{CoordinationError, ParseAddressError};
    use crate::listener::{Listener, MembershipDelta};
    use crate::live_server_set::LiveServerSet;
    use crate::lock_record::LockData;
    use crate::server_instance::{HostAndPort, ServerInstance};
    use crate::server_path::ServerPath;

    const ROOT: &str = "/cluster/tservers";

    #[derive(Debug, Clone, Default)]
    struct RecordingListener {
        deltas: Arc<Mutex<Vec<MembershipDelta>>>,
    }

    #[async_trait]
    impl Listener for RecordingListener {
        async fn update(&self, delta: &MembershipDelta) {
            self.deltas.lock().push(delta.clone());
        }
    }

    impl RecordingListener {
        fn calls(&self) -> usize {
            self.deltas.lock().len()
        }

        fn last(&self) -> MembershipDelta {
            self.deltas.lock().last().cloned().unwrap_or_default()
        }
    }

    /// Parks the pass inside the listener call while `gated` is set.
    #[derive(Debug, Default)]
    struct GatedListener {
        gated: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Listener for Arc<GatedListener> {
        async fn update(&self, _delta: &MembershipDelta) {
            if self.gated.load(Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
        }
    }

    struct Fixture {
        coordinator: MemoryCoordinator,
        listener: RecordingListener,
        set: LiveServerSet,
    }

    fn live_set<L: Listener>(coordinator: &MemoryCoordinator, settings: MembershipConfig, listener: L) -> LiveServerSet {
        let (factory, _) = scripted_pool(1);
        let factory: Arc<dyn ClientFactory> = Arc::new(factory);
        LiveServerSet::new(settings, Arc::new(coordinator.clone()), factory, listener)
    }

    fn fixture() -> Fixture {
        let coordinator = MemoryCoordinator::new(ROOT);
        let listener = RecordingListener::default();
        let set = live_set(&coordinator, MembershipConfig::default(), listener.clone());
        Fixture { coordinator, listener, set }
    }

    fn lock_server(coordinator: &MemoryCoordinator, group: &str, host: &str, session: &str) -> anyhow::Result<()> {
        let path = path(group, host);
        coordinator.create_server(&path);
        coordinator.acquire_lock(&path, &LockData::new(path.address().clone(), group), session)?;
        Ok(())
    }

    fn path(group: &str, host: &str) -> ServerPath {
        ServerPath::new(group, HostAndPort::new(host, 9997))
    }

    fn instance(host: &str, session: &str) -> ServerInstance {
        ServerInstance::new(HostAndPort::new(host, 9997), session)
    }

    impl Fixture {
        fn lock(&self, group: &str, host: &str, session: &str) -> anyhow::Result<()> {
            lock_server(&self.coordinator, group, host, session)
        }
    }

    #[tokio::test]
    async fn scan_adds_locked_servers() -> anyhow::Result<()> {
        let f = fixture();
        f.lock("default", "a", "1")?;
        f.lock("batch", "b", "2")?;
        f.coordinator.create_server(&path("default", "c"));
        let delta = f.set.scan_servers().await?;
        assert_eq!(delta.added.len(), 2);
        assert!(delta.removed.is_empty());
        assert_eq!(f.set.size().await, 2);
        assert_eq!(f.set.resource_group(&instance("b", "2")).await.as_deref(), Some("batch"));
        assert!(f.set.connection(&instance("a", "1")).await.is_some());
        assert!(f.set.connection(&instance("c", "1")).await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn rescan_without_changes_is_empty() -> anyhow::Result<()> {
        let f = fixture();
        f.lock("default", "a", "1")?;
        f.set.scan_servers().await?;
        let before = f.set.snapshot().await;
        let delta = f.set.scan_servers().await?;
        assert!(delta.is_empty());
        let after = f.set.snapshot().await;
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(f.listener.calls(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn one_listener_call_per_pass() -> anyhow::Result<()> {
        let f = fixture();
        f.lock("default", "a", "1")?;
        f.set.scan_servers().await?;
        f.coordinator.release_lock(&path("default", "a"), "1");
        f.lock("default", "b", "2")?;
        f.lock("batch", "c", "3")?;
        f.set.scan_servers().await?;
        assert_eq!(f.listener.calls(), 2);
        let delta = f.listener.last();
        assert_eq!(delta.added.len(), 2);
        assert_eq!(delta.removed.len(), 1);
        assert!(delta.removed.contains(&instance("a", "1")));
        Ok(())
    }

    #[tokio::test]
    async fn add_then_remove_leaves_no_trace() -> anyhow::Result<()> {
        let f = fixture();
        f.lock("default", "a", "1")?;
        f.set.scan_servers().await?;
        f.coordinator.release_lock(&path("default", "a"), "1");
        let delta = f.set.check_path(&path("default", "a")).await?;
        assert_eq!(delta.removed.len(), 1);
        assert!(f.set.snapshot().await.is_empty());
        assert!(f.set.current_servers().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn session_change_is_remove_and_add() -> anyhow::Result<()> {
        let f = fixture();
        f.lock("default", "a", "1")?;
        f.set.scan_servers().await?;
        f.coordinator.release_lock(&path("default", "a"), "1");
        f.lock("default", "a", "2")?;
        let delta = f.set.check_path(&path("default", "a")).await?;
        assert!(delta.removed.contains(&instance("a", "1")));
        assert!(delta.added.contains(&instance("a", "2")));
        assert_eq!(f.set.size().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn vanished_path_is_removed_on_scan() -> anyhow::Result<()> {
        let f = fixture();
        f.lock("default", "a", "1")?;
        f.set.scan_servers().await?;
        f.coordinator.recursive_delete(&path("default", "a")).await?;
        let delta = f.set.scan_servers().await?;
        assert!(delta.removed.contains(&instance("a", "1")));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unlocked_path_is_deleted_after_grace_period() -> anyhow::Result<()> {
        let f = fixture();
        let stale = path("default", "a");
        f.coordinator.create_server(&stale);
        f.set.scan_servers().await?;
        tokio::time::advance(Duration::from_secs(9 * 60 + 59)).await;
        f.set.scan_servers().await?;
        assert!(f.coordinator.contains_server(&stale));
        tokio::time::advance(Duration::from_secs(2)).await;
        f.set.scan_servers().await?;
        assert!(!f.coordinator.contains_server(&stale));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn lock_during_grace_period_cancels_deletion() -> anyhow::Result<()> {
        let f = fixture();
        let stale = path("default", "a");
        f.coordinator.create_server(&stale);
        f.set.scan_servers().await?;
        tokio::time::advance(Duration::from_secs(5 * 60)).await;
        f.lock("default", "a", "1")?;
        f.set.scan_servers().await?;
        f.coordinator.release_lock(&stale, "1");
        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        f.set.scan_servers().await?;
        assert!(f.coordinator.contains_server(&stale));
        Ok(())
    }

    #[tokio::test]
    async fn unavailable_namespace_aborts_scan() -> anyhow::Result<()> {
        let f = fixture();
        f.lock("default", "a", "1")?;
        f.set.scan_servers().await?;
        f.coordinator.set_unavailable(true);
        let error = f.set.scan_servers().await.unwrap_err();
        assert!(matches!(error, CoordinationError::Unavailable(_)));
        assert_eq!(f.set.size().await, 1);
        assert!(f.listener.last().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn malformed_lock_counts_as_unlocked() -> anyhow::Result<()> {
        let f = fixture();
        let broken = path("default", "a");
        f.coordinator.create_server(&broken);
        f.coordinator.put(f.coordinator.parser().lock_key(&broken, "1"), b"not json".to_vec());
        let delta = f.set.scan_servers().await?;
        assert!(delta.is_empty());
        assert_eq!(f.set.size().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn find_by_address_and_session() -> anyhow::Result<()> {
        let f = fixture();
        f.lock("default", "a", "1")?;
        f.set.scan_servers().await?;
        assert_eq!(f.set.find("a:9997").await?, Some(instance("a", "1")));
        assert_eq!(f.set.find("a:9997[1]").await?, Some(instance("a", "1")));
        assert_eq!(f.set.find("a:9997[2]").await?, None);
        assert_eq!(f.set.find("b:9997").await?, None);
        assert!(matches!(f.set.find("a").await, Err(ParseAddressError::MissingPort(_))));
        Ok(())
    }

    #[tokio::test]
    async fn find_prefers_first_resource_group() -> anyhow::Result<()> {
        let f = fixture();
        f.lock("default", "a", "2")?;
        f.lock("batch", "a", "1")?;
        f.set.scan_servers().await?;
        assert_eq!(f.set.find("a:9997").await?, Some(instance("a", "1")));
        Ok(())
    }

    #[tokio::test]
    async fn remove_evicts_and_deletes_subtree() -> anyhow::Result<()> {
        let f = fixture();
        f.lock("default", "a", "1")?;
        f.set.scan_servers().await?;
        let calls = f.listener.calls();
        f.set.remove(&instance("a", "1")).await?;
        assert_eq!(f.set.size().await, 0);
        assert!(!f.coordinator.contains_server(&path("default", "a")));
        assert_eq!(f.listener.calls(), calls);
        f.set.remove(&instance("a", "1")).await?;
        Ok(())
    }

    #[tokio::test]
    async fn failed_delete_on_remove_is_fatal() -> anyhow::Result<()> {
        let f = fixture();
        f.lock("default", "a", "1")?;
        f.set.scan_servers().await?;
        f.coordinator.set_fail_deletes(true);
        let error = f.set.remove(&instance("a", "1")).await.unwrap_err();
        assert_eq!(error.instance, instance("a", "1"));
        assert_eq!(error.path, format!("{}/default/a:9997", ROOT));
        assert_eq!(f.set.size().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn start_only_once() -> anyhow::Result<()> {
        let f = fixture();
        f.lock("default", "a", "1")?;
        f.set.start().await?;
        assert_eq!(f.set.size().await, 1);
        assert!(f.set.start().await.is_err());
        f.set.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn watch_events_drive_single_path_checks() -> anyhow::Result<()> {
        let f = fixture();
        f.set.start().await?;
        // the watch task subscribes asynchronously
        tokio::time::sleep(Duration::from_millis(100)).await;
        f.lock("default", "a", "1")?;
        tokio::time::timeout(Duration::from_secs(5), async {
            while f.set.size().await == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;
        assert_eq!(f.set.current_servers().await.into_iter().collect::<Vec<_>>(), vec![instance("a", "1")]);
        f.set.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn zero_scan_interval_fails_start() {
        let coordinator = MemoryCoordinator::new(ROOT);
        let mut settings = MembershipConfig::default();
        settings.scan_interval = ConfigDuration::from_secs(0);
        let set = live_set(&coordinator, settings, RecordingListener::default());
        assert!(set.start().await.is_err());
        assert!(set.tasks.lock().is_empty());
    }

    #[tokio::test]
    async fn readers_never_see_a_half_applied_pass() -> anyhow::Result<()> {
        let coordinator = MemoryCoordinator::new(ROOT);
        let listener = Arc::new(GatedListener::default());
        let set = live_set(&coordinator, MembershipConfig::default(), listener.clone());
        lock_server(&coordinator, "default", "a", "1")?;
        lock_server(&coordinator, "default", "b", "2")?;
        set.scan_servers().await?;
        let before = set.snapshot().await;

        coordinator.release_lock(&path("default", "a"), "1");
        listener.gated.store(true, Ordering::SeqCst);
        let pass = tokio::spawn({
            let set = set.clone();
            async move { set.scan_servers().await }
        });
        listener.entered.notified().await;
        let reader = tokio::spawn({
            let set = set.clone();
            async move { set.snapshot().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished());
        assert_eq!(before.len(), 2);
        assert!(before.contains(&instance("a", "1")));

        listener.release.notify_one();
        let delta = pass.await??;
        assert!(delta.removed.contains(&instance("a", "1")));
        let after = reader.await?;
        assert!(!after.contains(&instance("a", "1")));
        assert!(after.contains(&instance("b", "2")));
        assert_eq!(after.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn remove_skips_delete_without_namespace_match() -> anyhow::Result<()> {
        let f = fixture();
        f.lock("default", "a", "1")?;
        f.set.scan_servers().await?;
        let server = path("default", "a");
        f.coordinator.release_lock(&server, "1");
        f.coordinator.remove(&f.coordinator.parser().server_key(&server));
        // any delete attempt would now surface as a fatal error
        f.coordinator.set_fail_deletes(true);
        f.set.remove(&instance("a", "1")).await?;
        assert_eq!(f.set.size().await, 0);
        assert!(f.set.current_servers().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn deleted_path_is_not_tracked_as_stale() -> anyhow::Result<()> {
        let f = fixture();
        let gone = path("default", "a");
        let key = f.coordinator.create_server(&gone);
        f.set.scan_servers().await?;
        assert!(f.set.state.lock().await.stale.contains(&gone));
        f.coordinator.remove(&key);
        let delta = f.set.check_path(&gone).await?;
        assert!(delta.is_empty());
        assert!(!f.set.state.lock().await.stale.contains(&gone));

        let never_listed = path("default", "b");
        f.set.check_path(&never_listed).await?;
        assert!(f.set.state.lock().await.stale.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn resource_group_comes_from_lock_data() -> anyhow::Result<()> {
        let f = fixture();
        let server = path("default", "a");
        f.coordinator.create_server(&server);
        f.coordinator.acquire_lock(&server, &LockData::new(server.address().clone(), "batch"), "1")?;
        f.set.scan_servers().await?;
        assert_eq!(f.set.resource_group(&instance("a", "1")).await.as_deref(), Some("batch"));
        let snapshot = f.set.snapshot().await;
        assert!(snapshot.servers_in_group("batch").is_some_and(|servers| servers.contains(&instance("a", "1"))));
        assert!(snapshot.servers_in_group("default").is_none());
        Ok(())
    }
}
