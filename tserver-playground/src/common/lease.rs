use std::time::Duration;

use anyhow::Context;
use etcd_client::Client;
use tracing::{debug, warn};

const KEEP_ALIVE_RESP_TIMEOUT: Duration = Duration::from_secs(3);

/// Grants a lease of `ttl` seconds.
pub async fn grant_lease(client: &mut Client, ttl: i64) -> anyhow::Result<i64> {
    let resp = client.lease_grant(ttl, None).await.context("grant lease")?;
    debug!("granted lease {:x} with ttl {}s", resp.id(), resp.ttl());
    Ok(resp.id())
}

/// Keeps `lease_id` alive every `interval` until a keep alive request fails,
/// which is returned as the error.
pub async fn keep_lease_alive(mut client: Client, lease_id: i64, interval: Duration) -> anyhow::Result<()> {
    let (mut keeper, mut stream) = client.lease_keep_alive(lease_id).await?;
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        keeper
            .keep_alive()
            .await
            .with_context(|| format!("lease {:x} keep alive failed", lease_id))?;
        match tokio::time::timeout(KEEP_ALIVE_RESP_TIMEOUT, stream.message()).await {
            Ok(Ok(Some(resp))) if resp.ttl() <= 0 => {
                anyhow::bail!("lease {:x} expired", lease_id);
            }
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                warn!("wait lease {:x} keep alive response error {:?}", lease_id, error);
            }
            Err(_) => {
                warn!("wait lease {:x} keep alive response timeout", lease_id);
            }
        }
    }
}
