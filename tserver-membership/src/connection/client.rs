use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;
use crate::server_instance::HostAndPort;

pub const ROOT_TABLE_ID: &str = "+r";
pub const METADATA_TABLE_ID: &str = "!0";

/// Proof that a call comes from the manager currently holding the cluster's
/// manager lock. Tablet servers reject calls whose token is not the live holder.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ManagerLockToken {
    pub path: String,
    pub session: String,
}

/// A tablet: the rows of `table_id` in `(prev_end_row, end_row]`.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct KeyExtent {
    pub table_id: String,
    pub end_row: Option<Vec<u8>>,
    pub prev_end_row: Option<Vec<u8>>,
}

impl KeyExtent {
    pub fn new(table_id: impl Into<String>, end_row: Option<Vec<u8>>, prev_end_row: Option<Vec<u8>>) -> Self {
        Self {
            table_id: table_id.into(),
            end_row,
            prev_end_row,
        }
    }

    /// Tablets of the root and metadata tables.
    pub fn is_metadata(&self) -> bool {
        self.table_id == ROOT_TABLE_ID || self.table_id == METADATA_TABLE_ID
    }
}

impl Display for KeyExtent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let row = |row: &Option<Vec<u8>>| row.as_deref().map(|r| String::from_utf8_lossy(r).into_owned());
        match (row(&self.end_row), row(&self.prev_end_row)) {
            (None, None) => write!(f, "{}<<", self.table_id),
            (Some(end), None) => write!(f, "{};{}<", self.table_id, end),
            (None, Some(prev)) => write!(f, "{}<{}", self.table_id, prev),
            (Some(end), Some(prev)) => write!(f, "{};{}<{}", self.table_id, end, prev),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum UnloadGoal {
    Unknown,
    Unassigned,
    Suspended,
    Deleted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub online_tablets: u32,
    pub ingest_rate: f64,
    pub query_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TabletServerStatus {
    pub name: String,
    pub version: String,
    /// Milliseconds since the epoch at which the server answered.
    pub last_contact: u64,
    pub hold_time: u64,
    pub lookups: u64,
    pub table_map: HashMap<String, TableInfo>,
    /// Round trip measured by the caller, never sent over the wire.
    #[serde(skip)]
    pub response_time: Duration,
}

/// Remote operations a tablet server exposes to the manager.
#[async_trait]
pub trait TabletClient: Debug + Send {
    async fn load_tablet(&mut self, lock: &ManagerLockToken, extent: &KeyExtent) -> Result<(), RpcError>;

    async fn unload_tablet(
        &mut self,
        lock: &ManagerLockToken,
        extent: &KeyExtent,
        goal: UnloadGoal,
        request_time: SystemTime,
    ) -> Result<(), RpcError>;

    async fn get_tablet_server_status(&mut self, lock: &ManagerLockToken) -> Result<TabletServerStatus, RpcError>;

    async fn halt(&mut self, lock: &ManagerLockToken) -> Result<(), RpcError>;

    async fn fast_halt(&mut self, lock: &ManagerLockToken) -> Result<(), RpcError>;

    async fn flush(
        &mut self,
        lock: &ManagerLockToken,
        table_id: &str,
        start_row: Option<&[u8]>,
        end_row: Option<&[u8]>,
    ) -> Result<(), RpcError>;

    /// Whether the underlying transport can still carry calls.
    fn is_open(&self) -> bool;
}

/// Opens transports to tablet servers; the wire protocol lives behind this.
#[async_trait]
pub trait ClientFactory: Send + Sync + 'static {
    async fn connect(&self, address: &HostAndPort) -> Result<Box<dyn TabletClient>, RpcError>;
}
