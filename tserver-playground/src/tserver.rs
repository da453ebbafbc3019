use std::collections::{HashMap, HashSet};
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::Parser;
use etcd_client::{Client, GetOptions, PutOptions};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use tserver_membership::connection::client::{KeyExtent, ManagerLockToken, TableInfo, TabletServerStatus};
use tserver_membership::coordination::etcd::EtcdCoordinator;
use tserver_membership::ext::init_logger_with_filter;
use tserver_membership::lock_record::LockData;
use tserver_membership::server_instance::HostAndPort;
use tserver_membership::server_path::{ServerPath, ServerPathParser};
use tserver_playground::common::codec::PacketCodec;
use tserver_playground::common::lease::{grant_lease, keep_lease_alive};
use tserver_playground::common::rpc::{Request, Response};

#[derive(Parser, Debug)]
struct Args {
    #[arg(short, long)]
    addr: SocketAddrV4,
    #[arg(short, long, default_value = "127.0.0.1:2379")]
    etcd: String,
    #[arg(short, long, default_value = "/cluster/tservers")]
    root: String,
    #[arg(short, long, default_value = "default")]
    group: String,
    #[arg(long, default_value_t = 10)]
    ttl: i64,
}

struct TabletServer {
    address: HostAndPort,
    client: Client,
    tablets: Mutex<HashSet<KeyExtent>>,
    lookups: Mutex<u64>,
    halt: Notify,
}

impl TabletServer {
    async fn check_lock(&self, lock: &ManagerLockToken) -> anyhow::Result<()> {
        let mut client = self.client.clone();
        let resp = client.get(lock.path.as_str(), Some(GetOptions::new().with_count_only())).await?;
        if resp.count() == 0 {
            anyhow::bail!("manager lock {} is not held", lock.path);
        }
        Ok(())
    }

    async fn handle(&self, request: Request) -> anyhow::Result<Response> {
        self.check_lock(request.lock()).await?;
        let response = match request {
            Request::LoadTablet { extent, .. } => {
                info!("load tablet {}", extent);
                self.tablets.lock().await.insert(extent);
                Response::Done
            }
            Request::UnloadTablet { extent, goal, .. } => {
                info!("unload tablet {} with goal {:?}", extent, goal);
                self.tablets.lock().await.remove(&extent);
                Response::Done
            }
            Request::GetStatus { .. } => Response::Status(self.status().await),
            Request::Halt { .. } | Request::FastHalt { .. } => {
                warn!("halt requested by manager");
                self.halt.notify_one();
                Response::Done
            }
            Request::Flush { table_id, .. } => {
                info!("flush table {}", table_id);
                Response::Done
            }
        };
        Ok(response)
    }

    async fn status(&self) -> TabletServerStatus {
        let mut lookups = self.lookups.lock().await;
        *lookups += 1;
        let mut table_map: HashMap<String, TableInfo> = HashMap::new();
        for extent in self.tablets.lock().await.iter() {
            table_map.entry(extent.table_id.clone()).or_default().online_tablets += 1;
        }
        let last_contact = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        TabletServerStatus {
            name: self.address.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            last_contact,
            hold_time: 0,
            lookups: *lookups,
            table_map,
            response_time: Duration::ZERO,
        }
    }
}

async fn serve(server: Arc<TabletServer>, stream: TcpStream) -> anyhow::Result<()> {
    let mut framed = Framed::new(stream, PacketCodec);
    while let Some(packet) = framed.next().await {
        let packet = packet?;
        let request: Request = serde_json::from_slice(&packet).context("decode request")?;
        let response = match server.handle(request).await {
            Ok(response) => response,
            Err(error) => Response::Failed(format!("{:#}", error)),
        };
        framed.send(response.to_packet()?).await?;
    }
    Ok(())
}

async fn accept(server: Arc<TabletServer>, listener: TcpListener) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!("accept manager connection from {}", peer);
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(error) = serve(server, stream).await {
                warn!("connection from {} closed: {:#}", peer, error);
            }
        });
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logger_with_filter("tserver=debug,tserver_membership=debug");
    let mut client = Client::connect([args.etcd.as_str()], None).await?;
    let parser = ServerPathParser::new(args.root);
    let address = HostAndPort::new(args.addr.ip().to_string(), args.addr.port());
    let path = ServerPath::new(args.group.clone(), address.clone());
    let listener = TcpListener::bind(args.addr).await?;

    let lease_id = grant_lease(&mut client, args.ttl).await?;
    let session = EtcdCoordinator::session_of(lease_id);
    client.put(parser.server_key(&path), "", None).await?;
    let data = LockData::new(address.clone(), args.group);
    let lock_key = parser.lock_key(&path, &session);
    client
        .put(lock_key.as_str(), data.to_vec()?, Some(PutOptions::new().with_lease(lease_id)))
        .await
        .context("publish server lock")?;
    info!("tablet server {}[{}] serving on {}", address, session, args.addr);

    let server = Arc::new(TabletServer {
        address,
        client: client.clone(),
        tablets: Mutex::new(HashSet::new()),
        lookups: Mutex::new(0),
        halt: Notify::new(),
    });
    let keep_alive_interval = Duration::from_secs((args.ttl / 3).max(1) as u64);
    tokio::select! {
        result = keep_lease_alive(client.clone(), lease_id, keep_alive_interval) => {
            if let Err(error) = result {
                error!("lost server lock: {:#}", error);
            }
        }
        result = accept(server.clone(), listener) => {
            if let Err(error) = result {
                error!("stop serving: {:#}", error);
            }
        }
        _ = server.halt.notified() => {
            info!("halting");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
        }
    }
    // revoking the lease drops the lock entry with it
    if let Err(error) = client.lease_revoke(lease_id).await {
        warn!("revoke lease {} failed: {}", session, error);
    }
    Ok(())
}
