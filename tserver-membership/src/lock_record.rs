use serde::{Deserialize, Serialize};

use crate::server_instance::{HostAndPort, ServerInstance};

/// Payload a tablet server writes into its lock entry when it acquires the lock.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct LockData {
    pub address: HostAndPort,
    pub group: String,
}

impl LockData {
    pub fn new(address: HostAndPort, group: impl Into<String>) -> Self {
        Self {
            address,
            group: group.into(),
        }
    }

    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// The current holder of a server lock: the published payload joined with the
/// session the coordination service assigned to the holder.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LockRecord {
    pub address: HostAndPort,
    pub group: String,
    pub session: String,
    /// Opaque freshness token of the read, only meaningful for logging.
    pub revision: i64,
}

impl LockRecord {
    pub fn new(data: LockData, session: impl Into<String>, revision: i64) -> Self {
        Self {
            address: data.address,
            group: data.group,
            session: session.into(),
            revision,
        }
    }

    pub fn instance(&self) -> ServerInstance {
        ServerInstance::new(self.address.clone(), self.session.clone())
    }
}
