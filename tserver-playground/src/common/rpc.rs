use std::io;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::trace;

use tserver_membership::connection::client::{ClientFactory, KeyExtent, ManagerLockToken, TabletClient, TabletServerStatus, UnloadGoal};
use tserver_membership::error::RpcError;
use tserver_membership::server_instance::HostAndPort;

use crate::common::codec::{Packet, PacketCodec};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    LoadTablet {
        lock: ManagerLockToken,
        extent: KeyExtent,
    },
    UnloadTablet {
        lock: ManagerLockToken,
        extent: KeyExtent,
        goal: UnloadGoal,
        request_time: SystemTime,
    },
    GetStatus {
        lock: ManagerLockToken,
    },
    Halt {
        lock: ManagerLockToken,
    },
    FastHalt {
        lock: ManagerLockToken,
    },
    Flush {
        lock: ManagerLockToken,
        table_id: String,
        start_row: Option<Vec<u8>>,
        end_row: Option<Vec<u8>>,
    },
}

impl Request {
    pub fn lock(&self) -> &ManagerLockToken {
        match self {
            Request::LoadTablet { lock, .. }
            | Request::UnloadTablet { lock, .. }
            | Request::GetStatus { lock }
            | Request::Halt { lock }
            | Request::FastHalt { lock }
            | Request::Flush { lock, .. } => lock,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Done,
    Status(TabletServerStatus),
    Failed(String),
}

impl Response {
    pub fn to_packet(&self) -> anyhow::Result<Packet> {
        Ok(Packet::new(serde_json::to_vec(self)?))
    }
}

/// Tablet client speaking length prefixed JSON over one TCP connection.
#[derive(Debug)]
pub struct JsonTabletClient {
    address: HostAndPort,
    framed: Framed<TcpStream, PacketCodec>,
    open: bool,
}

impl JsonTabletClient {
    pub fn new(address: HostAndPort, stream: TcpStream) -> Self {
        Self {
            address,
            framed: Framed::new(stream, PacketCodec),
            open: true,
        }
    }

    async fn call(&mut self, request: Request) -> Result<Response, RpcError> {
        let body = serde_json::to_vec(&request).map_err(|error| self.protocol(error))?;
        trace!("call {} with {} bytes", self.address, body.len());
        if let Err(error) = self.framed.send(Packet::new(body)).await {
            return Err(self.broken(error));
        }
        let packet = match self.framed.next().await {
            Some(Ok(packet)) => packet,
            Some(Err(error)) => return Err(self.broken(error)),
            None => return Err(self.broken(io::Error::from(io::ErrorKind::UnexpectedEof))),
        };
        match serde_json::from_slice::<Response>(&packet).map_err(|error| self.protocol(error))? {
            Response::Failed(message) => Err(RpcError::Remote { address: self.address.clone(), message }),
            response => Ok(response),
        }
    }

    async fn call_done(&mut self, request: Request) -> Result<(), RpcError> {
        match self.call(request).await? {
            Response::Done => Ok(()),
            other => Err(RpcError::Protocol { address: self.address.clone(), message: format!("expect Done, got {:?}", other) }),
        }
    }

    fn broken(&mut self, source: io::Error) -> RpcError {
        self.open = false;
        RpcError::Transport { address: self.address.clone(), source }
    }

    fn protocol(&mut self, error: serde_json::Error) -> RpcError {
        self.open = false;
        RpcError::Protocol { address: self.address.clone(), message: error.to_string() }
    }
}

#[async_trait]
impl TabletClient for JsonTabletClient {
    async fn load_tablet(&mut self, lock: &ManagerLockToken, extent: &KeyExtent) -> Result<(), RpcError> {
        self.call_done(Request::LoadTablet { lock: lock.clone(), extent: extent.clone() }).await
    }

    async fn unload_tablet(&mut self, lock: &ManagerLockToken, extent: &KeyExtent, goal: UnloadGoal, request_time: SystemTime) -> Result<(), RpcError> {
        let request = Request::UnloadTablet {
            lock: lock.clone(),
            extent: extent.clone(),
            goal,
            request_time,
        };
        self.call_done(request).await
    }

    async fn get_tablet_server_status(&mut self, lock: &ManagerLockToken) -> Result<TabletServerStatus, RpcError> {
        match self.call(Request::GetStatus { lock: lock.clone() }).await? {
            Response::Status(status) => Ok(status),
            other => Err(RpcError::Protocol { address: self.address.clone(), message: format!("expect Status, got {:?}", other) }),
        }
    }

    async fn halt(&mut self, lock: &ManagerLockToken) -> Result<(), RpcError> {
        self.call_done(Request::Halt { lock: lock.clone() }).await
    }

    async fn fast_halt(&mut self, lock: &ManagerLockToken) -> Result<(), RpcError> {
        self.call_done(Request::FastHalt { lock: lock.clone() }).await
    }

    async fn flush(&mut self, lock: &ManagerLockToken, table_id: &str, start_row: Option<&[u8]>, end_row: Option<&[u8]>) -> Result<(), RpcError> {
        let request = Request::Flush {
            lock: lock.clone(),
            table_id: table_id.to_string(),
            start_row: start_row.map(<[u8]>::to_vec),
            end_row: end_row.map(<[u8]>::to_vec),
        };
        self.call_done(request).await
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[derive(Debug, Clone)]
pub struct JsonClientFactory {
    pub connect_timeout: Duration,
}

impl Default for JsonClientFactory {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
        }
    }
}

#[async_trait]
impl ClientFactory for JsonClientFactory {
    async fn connect(&self, address: &HostAndPort) -> Result<Box<dyn TabletClient>, RpcError> {
        let connect = TcpStream::connect((address.host(), address.port()));
        let stream = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => {
                return Err(RpcError::Connect { address: address.clone(), reason: error.to_string() });
            }
            Err(_) => {
                return Err(RpcError::Connect { address: address.clone(), reason: format!("timeout after {:?}", self.connect_timeout) });
            }
        };
        stream.set_nodelay(true).map_err(|source| RpcError::Transport { address: address.clone(), source })?;
        Ok(Box::new(JsonTabletClient::new(address.clone(), stream)))
    }
}
