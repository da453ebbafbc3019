use thiserror::Error;

use crate::server_instance::{HostAndPort, ServerInstance};

/// Recoverable failures talking to the coordination service. A reconciliation
/// pass that hits one of these is abandoned and retried on the next tick or event.
#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("coordination service unavailable: {0}")]
    Unavailable(String),
    #[error("node {0} still has children")]
    NotEmpty(String),
    #[error("lock data at {key} is malformed: {source}")]
    MalformedLock {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("watch on {0} fell behind and dropped events")]
    WatchLagged(String),
    #[error("watch on {0} was canceled by the coordination service")]
    WatchCanceled(String),
    #[error(transparent)]
    Etcd(#[from] etcd_client::Error),
}

/// Deleting the coordination subtree of an evicted server failed. The lock may
/// still be visible to the rest of the cluster as a live holder of resources,
/// so the owning process is expected to terminate.
#[derive(Error, Debug)]
#[error("failed to delete coordination lock {path} of {instance}")]
pub struct FatalRemoveError {
    pub instance: ServerInstance,
    pub path: String,
    #[source]
    pub source: CoordinationError,
}

/// Failures of a remote call through a server connection. Never retried here.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("cannot connect to {address}: {reason}")]
    Connect {
        address: HostAndPort,
        reason: String,
    },
    #[error("transport to {address} failed: {source}")]
    Transport {
        address: HostAndPort,
        #[source]
        source: std::io::Error,
    },
    #[error("{address} rejected the call: {message}")]
    Remote {
        address: HostAndPort,
        message: String,
    },
    #[error("unexpected response from {address}: {message}")]
    Protocol {
        address: HostAndPort,
        message: String,
    },
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ParseAddressError {
    #[error("address {0} is missing a port")]
    MissingPort(String),
    #[error("address {0} has an invalid port")]
    InvalidPort(String),
    #[error("address {0} has an empty host")]
    EmptyHost(String),
    #[error("address {0} has an unterminated session suffix")]
    UnterminatedSession(String),
}
