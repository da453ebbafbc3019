use std::collections::BTreeSet;
use std::fmt::Debug;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::CoordinationError;
use crate::lock_record::LockRecord;
use crate::server_path::ServerPath;

pub mod etcd;
pub mod memory;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChangeKind {
    Put,
    Delete,
}

/// A change somewhere below the watched namespace root.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChangeEvent {
    pub path: String,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Events are delivered in batches as the coordination service reports them.
/// An `Err` item means the watch is broken and must be re-established.
pub type ChangeStream = BoxStream<'static, Result<Vec<ChangeEvent>, CoordinationError>>;

/// The slice of the coordination service the membership tracker consumes. An
/// implementation is bound to one namespace root holding `<group>/<host:port>` nodes.
#[async_trait]
pub trait CoordinationClient: Debug + Send + Sync + 'static {
    fn root(&self) -> &str;

    /// Every server path present under the root, across all resource groups.
    async fn list_servers(&self) -> Result<BTreeSet<ServerPath>, CoordinationError>;

    /// The current lock holder of `path`, if any.
    async fn read_lock(&self, path: &ServerPath) -> Result<Option<LockRecord>, CoordinationError>;

    /// Whether the server node or anything below it is still present.
    async fn exists(&self, path: &ServerPath) -> Result<bool, CoordinationError>;

    /// Deletes the server node itself, atomically with the check that it has
    /// no children. A missing node is not an error; a node that gained
    /// children fails with [`CoordinationError::NotEmpty`].
    async fn delete(&self, path: &ServerPath) -> Result<(), CoordinationError>;

    /// Deletes the server node and everything below it, skipping missing nodes.
    async fn recursive_delete(&self, path: &ServerPath) -> Result<(), CoordinationError>;

    async fn watch(&self) -> Result<ChangeStream, CoordinationError>;
}
