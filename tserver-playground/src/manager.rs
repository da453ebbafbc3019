use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use etcd_client::{Client, LockOptions};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use tserver_membership::config::MembershipConfig;
use tserver_membership::connection::client::ManagerLockToken;
use tserver_membership::coordination::etcd::EtcdCoordinator;
use tserver_membership::ext::init_logger_with_filter;
use tserver_membership::listener::MembershipDelta;
use tserver_membership::live_server_set::LiveServerSet;
use tserver_membership::server_instance::ServerInstance;
use tserver_playground::common::lease::{grant_lease, keep_lease_alive};
use tserver_playground::common::rpc::JsonClientFactory;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `etcd.endpoints` of the configuration.
    #[arg(short, long)]
    etcd: Option<String>,
    /// Overrides `namespace_root` of the configuration.
    #[arg(short, long)]
    root: Option<String>,
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "/cluster/managers/lock")]
    manager_lock: String,
    #[arg(long, default_value_t = 10)]
    status_interval: u64,
    #[arg(long, default_value_t = 3)]
    max_failures: u32,
}

fn load_config(args: &Args) -> anyhow::Result<MembershipConfig> {
    let mut builder = MembershipConfig::builder();
    if let Some(file) = &args.config {
        builder = builder.add_source(config::File::from(file.as_path()))?;
    }
    builder = builder.add_source(config::Environment::with_prefix("TSERVER").separator("__"))?;
    let mut settings = builder.build()?;
    if let Some(etcd) = &args.etcd {
        settings.etcd.endpoints = vec![etcd.clone()];
    }
    if let Some(root) = &args.root {
        settings.namespace_root = root.clone();
    }
    Ok(settings)
}

async fn log_deltas(mut deltas: mpsc::Receiver<MembershipDelta>) {
    while let Some(delta) = deltas.recv().await {
        for instance in &delta.removed {
            info!("tablet server {} is gone", instance);
        }
        for instance in &delta.added {
            info!("tablet server {} is up", instance);
        }
    }
}

/// Polls every live server and evicts the ones failing `max_failures` status checks in a row.
async fn poll_servers(set: LiveServerSet, lock: ManagerLockToken, interval: Duration, max_failures: u32) -> anyhow::Result<()> {
    let mut failures: HashMap<ServerInstance, u32> = HashMap::new();
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let snapshot = set.snapshot().await;
        failures.retain(|instance, _| snapshot.contains(instance));
        for instance in snapshot.servers() {
            let Some(connection) = snapshot.connection(instance) else {
                continue;
            };
            match connection.get_status(&lock, true).await {
                Ok(status) => {
                    failures.remove(instance);
                    debug!("{} answered in {:?} hosting {} tables", instance, status.response_time, status.table_map.len());
                }
                Err(error) => {
                    let count = failures.entry(instance.clone()).or_default();
                    *count += 1;
                    warn!("status check {}/{} of {} failed: {}", count, max_failures, instance, error);
                    if *count >= max_failures {
                        failures.remove(instance);
                        set.remove(instance).await?;
                    }
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logger_with_filter("manager=debug,tserver_membership=debug");
    let settings = load_config(&args)?;
    let mut client = Client::connect(&settings.etcd.endpoints, None).await?;

    let lease_id = grant_lease(&mut client, 10).await?;
    let lock = client
        .lock(args.manager_lock.as_str(), Some(LockOptions::new().with_lease(lease_id)))
        .await
        .context("acquire manager lock")?;
    let lock = ManagerLockToken {
        path: String::from_utf8_lossy(lock.key()).into_owned(),
        session: EtcdCoordinator::session_of(lease_id),
    };
    info!("manager lock {} acquired", lock.path);

    let coordinator = EtcdCoordinator::new(client.clone(), settings.namespace_root.clone());
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(log_deltas(rx));
    let set = LiveServerSet::new(settings, Arc::new(coordinator), Arc::new(JsonClientFactory::default()), tx);
    set.start().await?;

    let status_interval = Duration::from_secs(args.status_interval);
    tokio::select! {
        result = poll_servers(set.clone(), lock, status_interval, args.max_failures) => {
            if let Err(error) = result {
                // a lock that survived its eviction could be taken for a live server
                error!("{:#}", error);
                std::process::exit(1);
            }
        }
        result = keep_lease_alive(client.clone(), lease_id, Duration::from_secs(3)) => {
            if let Err(error) = result {
                error!("lost manager lock: {:#}", error);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
        }
    }
    set.shutdown();
    if let Err(error) = client.lease_revoke(lease_id).await {
        warn!("revoke manager lease failed: {}", error);
    }
    Ok(())
}
