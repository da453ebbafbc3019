use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, DeleteOptions, EventType, GetOptions, SortOrder, SortTarget, Txn, TxnOp, WatchOptions};
use futures::StreamExt;
use tracing::{debug, trace};

use crate::coordination::{ChangeEvent, ChangeKind, ChangeStream, CoordinationClient};
use crate::error::CoordinationError;
use crate::lock_record::{LockData, LockRecord};
use crate::server_path::{ServerPath, ServerPathParser, WatchedPath};

/// Coordination backed by etcd.
///
/// A tablet server keeps a plain key at `<root>/<group>/<host:port>` and takes
/// its lock by writing `<root>/<group>/<host:port>/lock/<lease>` under its own
/// lease. The entry with the lowest create revision holds the lock, and the
/// hex lease id is the holder's session.
#[derive(Clone)]
pub struct EtcdCoordinator {
    client: Client,
    parser: ServerPathParser,
}

impl Debug for EtcdCoordinator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdCoordinator")
            .field("root", &self.parser.root())
            .finish_non_exhaustive()
    }
}

impl EtcdCoordinator {
    pub fn new(client: Client, root: impl Into<String>) -> Self {
        Self {
            client,
            parser: ServerPathParser::new(root),
        }
    }

    pub async fn connect<E: AsRef<str>, S: AsRef<[E]>>(endpoints: S, root: impl Into<String>) -> Result<Self, CoordinationError> {
        let client = Client::connect(endpoints, None).await?;
        Ok(Self::new(client, root))
    }

    pub fn parser(&self) -> &ServerPathParser {
        &self.parser
    }

    pub fn session_of(lease: i64) -> String {
        format!("{:x}", lease)
    }
}

#[async_trait]
impl CoordinationClient for EtcdCoordinator {
    fn root(&self) -> &str {
        self.parser.root()
    }

    async fn list_servers(&self) -> Result<BTreeSet<ServerPath>, CoordinationError> {
        let mut client = self.client.clone();
        let prefix = format!("{}/", self.parser.root());
        let resp = client.get(prefix, Some(GetOptions::new().with_prefix().with_keys_only())).await?;
        let mut servers = BTreeSet::new();
        for kv in resp.kvs() {
            let key = kv.key_str()?;
            match self.parser.classify(key) {
                WatchedPath::Server(path) => {
                    servers.insert(path);
                }
                WatchedPath::Malformed(reason) => {
                    debug!("skip malformed server key {}", reason);
                }
                _ => {}
            }
        }
        Ok(servers)
    }

    async fn read_lock(&self, path: &ServerPath) -> Result<Option<LockRecord>, CoordinationError> {
        let mut client = self.client.clone();
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Create, SortOrder::Ascend)
            .with_limit(1);
        let resp = client.get(self.parser.lock_prefix(path), Some(options)).await?;
        match resp.kvs().first() {
            None => Ok(None),
            Some(kv) => {
                let key = kv.key_str()?;
                let data = LockData::from_slice(kv.value()).map_err(|source| {
                    CoordinationError::MalformedLock { key: key.to_string(), source }
                })?;
                trace!("lock of {} held by lease {} at revision {}", path, kv.lease(), kv.mod_revision());
                Ok(Some(LockRecord::new(data, Self::session_of(kv.lease()), kv.mod_revision())))
            }
        }
    }

    async fn exists(&self, path: &ServerPath) -> Result<bool, CoordinationError> {
        let mut client = self.client.clone();
        let key = self.parser.server_key(path);
        let node = client.get(key.as_str(), Some(GetOptions::new().with_count_only())).await?;
        if node.count() > 0 {
            return Ok(true);
        }
        let children = client
            .get(format!("{}/", key), Some(GetOptions::new().with_prefix().with_count_only()))
            .await?;
        Ok(children.count() > 0)
    }

    async fn delete(&self, path: &ServerPath) -> Result<(), CoordinationError> {
        let mut client = self.client.clone();
        let key = self.parser.server_key(path);
        let childless = Compare::version(format!("{}/", key), CompareOp::Equal, 0).with_prefix();
        let txn = Txn::new()
            .when([childless])
            .and_then([TxnOp::delete(key.as_str(), None)]);
        let resp = client.txn(txn).await?;
        if !resp.succeeded() {
            return Err(CoordinationError::NotEmpty(key));
        }
        Ok(())
    }

    async fn recursive_delete(&self, path: &ServerPath) -> Result<(), CoordinationError> {
        let mut client = self.client.clone();
        let key = self.parser.server_key(path);
        client.delete(format!("{}/", key), Some(DeleteOptions::new().with_prefix())).await?;
        client.delete(key, None).await?;
        Ok(())
    }

    async fn watch(&self) -> Result<ChangeStream, CoordinationError> {
        let mut client = self.client.clone();
        let root = self.parser.root().to_string();
        let (watcher, stream) = client.watch(root.as_str(), Some(WatchOptions::new().with_prefix())).await?;
        debug!("watch {} started with id {}", root, watcher.watch_id());
        // the watcher is kept in the state, dropping it ends the watch
        let changes = futures::stream::unfold((watcher, stream, root), |(watcher, mut stream, root)| async move {
            match stream.message().await {
                Ok(Some(resp)) if resp.canceled() => {
                    Some((Err(CoordinationError::WatchCanceled(root.clone())), (watcher, stream, root)))
                }
                Ok(Some(resp)) => {
                    let events = resp
                        .events()
                        .iter()
                        .filter_map(|event| {
                            let kind = match event.event_type() {
                                EventType::Put => ChangeKind::Put,
                                EventType::Delete => ChangeKind::Delete,
                            };
                            let key = event.kv()?.key_str().ok()?;
                            Some(ChangeEvent::new(key, kind))
                        })
                        .collect::<Vec<_>>();
                    Some((Ok(events), (watcher, stream, root)))
                }
                Ok(None) => None,
                Err(error) => Some((Err(CoordinationError::from(error)), (watcher, stream, root))),
            }
        });
        Ok(changes.boxed())
    }
}
