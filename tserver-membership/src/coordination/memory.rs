use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::coordination::{ChangeEvent, ChangeKind, ChangeStream, CoordinationClient};
use crate::error::CoordinationError;
use crate::lock_record::{LockData, LockRecord};
use crate::server_path::{ServerPath, ServerPathParser, WatchedPath};

const WATCH_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
struct MemoryNode {
    value: Vec<u8>,
    session: Option<String>,
    create_revision: i64,
}

#[derive(Debug, Default)]
struct Namespace {
    nodes: BTreeMap<String, MemoryNode>,
    revision: i64,
}

/// In-process coordination namespace with the same layout as the etcd backend.
/// Useful for single-process setups and for exercising failure paths.
#[derive(Debug, Clone)]
pub struct MemoryCoordinator {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    parser: ServerPathParser,
    namespace: Mutex<Namespace>,
    events: broadcast::Sender<ChangeEvent>,
    unavailable: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemoryCoordinator {
    pub fn new(root: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        let inner = Inner {
            parser: ServerPathParser::new(root),
            namespace: Mutex::new(Namespace::default()),
            events,
            unavailable: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn parser(&self) -> &ServerPathParser {
        &self.inner.parser
    }

    /// Every read and write fails while unavailable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.inner.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn put(&self, key: impl Into<String>, value: Vec<u8>) {
        self.put_node(key.into(), value, None);
    }

    /// Creates the server node a tablet server publishes before taking its lock.
    pub fn create_server(&self, path: &ServerPath) -> String {
        let key = self.inner.parser.server_key(path);
        self.put_node(key.clone(), vec![], None);
        key
    }

    /// Adds a lock entry owned by `session`. Entries queue in creation order.
    pub fn acquire_lock(&self, path: &ServerPath, data: &LockData, session: &str) -> anyhow::Result<String> {
        let key = self.inner.parser.lock_key(path, session);
        self.put_node(key.clone(), data.to_vec()?, Some(session.to_string()));
        Ok(key)
    }

    pub fn release_lock(&self, path: &ServerPath, session: &str) {
        let key = self.inner.parser.lock_key(path, session);
        self.remove(&key);
    }

    /// Removes a single key, as an external tool or an expired session would.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.inner.namespace.lock().nodes.remove(key).is_some();
        if removed {
            self.publish(key, ChangeKind::Delete);
        }
        removed
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.namespace.lock().nodes.contains_key(key)
    }

    pub fn contains_server(&self, path: &ServerPath) -> bool {
        let key = self.inner.parser.server_key(path);
        let prefix = format!("{}/", key);
        let namespace = self.inner.namespace.lock();
        namespace.nodes.contains_key(&key) || Self::children_of(&namespace.nodes, &prefix).next().is_some()
    }

    fn put_node(&self, key: String, value: Vec<u8>, session: Option<String>) {
        {
            let mut namespace = self.inner.namespace.lock();
            namespace.revision += 1;
            let create_revision = namespace.revision;
            namespace.nodes.insert(key.clone(), MemoryNode { value, session, create_revision });
        }
        self.publish(&key, ChangeKind::Put);
    }

    fn publish(&self, key: &str, kind: ChangeKind) {
        // no receivers just means nobody watches yet
        let _ = self.inner.events.send(ChangeEvent::new(key, kind));
    }

    fn check_available(&self) -> Result<(), CoordinationError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            Err(CoordinationError::Unavailable(format!("memory namespace {} is offline", self.inner.parser.root())))
        } else {
            Ok(())
        }
    }

    fn check_delete_allowed(&self, key: &str) -> Result<(), CoordinationError> {
        if self.inner.fail_deletes.load(Ordering::SeqCst) {
            Err(CoordinationError::Unavailable(format!("delete of {} rejected", key)))
        } else {
            Ok(())
        }
    }

    fn children_of<'a>(nodes: &'a BTreeMap<String, MemoryNode>, prefix: &'a str) -> impl Iterator<Item=(&'a String, &'a MemoryNode)> + 'a {
        nodes
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
    }
}

#[async_trait]
impl CoordinationClient for MemoryCoordinator {
    fn root(&self) -> &str {
        self.inner.parser.root()
    }

    async fn list_servers(&self) -> Result<BTreeSet<ServerPath>, CoordinationError> {
        self.check_available()?;
        let namespace = self.inner.namespace.lock();
        let servers = namespace
            .nodes
            .keys()
            .filter_map(|key| match self.inner.parser.classify(key) {
                WatchedPath::Server(path) => Some(path),
                _ => None,
            })
            .collect();
        Ok(servers)
    }

    async fn read_lock(&self, path: &ServerPath) -> Result<Option<LockRecord>, CoordinationError> {
        self.check_available()?;
        let prefix = self.inner.parser.lock_prefix(path);
        let namespace = self.inner.namespace.lock();
        let holder = Self::children_of(&namespace.nodes, &prefix)
            .min_by_key(|(_, node)| node.create_revision);
        match holder {
            None => Ok(None),
            Some((key, node)) => {
                let data = LockData::from_slice(&node.value).map_err(|source| {
                    CoordinationError::MalformedLock { key: key.clone(), source }
                })?;
                let session = node
                    .session
                    .clone()
                    .unwrap_or_else(|| key[prefix.len()..].to_string());
                Ok(Some(LockRecord::new(data, session, node.create_revision)))
            }
        }
    }

    async fn exists(&self, path: &ServerPath) -> Result<bool, CoordinationError> {
        self.check_available()?;
        Ok(self.contains_server(path))
    }

    async fn delete(&self, path: &ServerPath) -> Result<(), CoordinationError> {
        self.check_available()?;
        let key = self.inner.parser.server_key(path);
        self.check_delete_allowed(&key)?;
        let prefix = format!("{}/", key);
        let removed = {
            let mut namespace = self.inner.namespace.lock();
            if Self::children_of(&namespace.nodes, &prefix).next().is_some() {
                return Err(CoordinationError::NotEmpty(key));
            }
            namespace.nodes.remove(&key).is_some()
        };
        if removed {
            self.publish(&key, ChangeKind::Delete);
        }
        Ok(())
    }

    async fn recursive_delete(&self, path: &ServerPath) -> Result<(), CoordinationError> {
        self.check_available()?;
        let key = self.inner.parser.server_key(path);
        self.check_delete_allowed(&key)?;
        let prefix = format!("{}/", key);
        let removed = {
            let mut namespace = self.inner.namespace.lock();
            let mut doomed = Self::children_of(&namespace.nodes, &prefix)
                .map(|(k, _)| k.clone())
                .collect::<Vec<_>>();
            if namespace.nodes.contains_key(&key) {
                doomed.push(key.clone());
            }
            for k in &doomed {
                namespace.nodes.remove(k);
            }
            doomed
        };
        for k in removed {
            self.publish(&k, ChangeKind::Delete);
        }
        Ok(())
    }

    async fn watch(&self) -> Result<ChangeStream, CoordinationError> {
        self.check_available()?;
        let receiver = self.inner.events.subscribe();
        let root = self.inner.parser.root().to_string();
        let changes = futures::stream::unfold(Some((receiver, root)), |state| async move {
            let (mut receiver, root) = state?;
            match receiver.recv().await {
                Ok(event) => Some((Ok(vec![event]), Some((receiver, root)))),
                Err(RecvError::Lagged(_)) => Some((Err(CoordinationError::WatchLagged(root)), None)),
                Err(RecvError::Closed) => None,
            }
        });
        Ok(changes.boxed())
    }
}
