use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, trace, warn};

use crate::coordination::{ChangeEvent, CoordinationClient};
use crate::live_server_set::{Inner, LiveServerSet};
use crate::server_path::{ServerPath, ServerPathParser, WatchedPath};

/// Work items for the single task that mutates the membership.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum Reconcile {
    FullScan,
    CheckPath(ServerPath),
}

pub(crate) fn reconcile_request(parser: &ServerPathParser, event: &ChangeEvent) -> Option<Reconcile> {
    match parser.classify(&event.path) {
        WatchedPath::Root => Some(Reconcile::FullScan),
        WatchedPath::Group(group) => {
            trace!("group {} changed, rescan", group);
            Some(Reconcile::FullScan)
        }
        WatchedPath::Server(path) => Some(Reconcile::CheckPath(path)),
        WatchedPath::Unrelated => {
            debug!("ignore {:?} event outside {}: {}", event.kind, parser.root(), event.path);
            None
        }
        WatchedPath::Malformed(reason) => {
            debug!("ignore {:?} event on malformed path: {}", event.kind, reason);
            None
        }
    }
}

pub(crate) async fn reconcile_loop(set: Weak<Inner>, mut queue: mpsc::Receiver<Reconcile>) {
    while let Some(request) = queue.recv().await {
        let Some(inner) = set.upgrade() else {
            break;
        };
        let set = LiveServerSet { inner };
        match request {
            Reconcile::FullScan => {
                if let Err(error) = set.scan_servers().await {
                    error!("scan of server namespace {} failed: {}", set.parser.root(), error);
                }
            }
            Reconcile::CheckPath(path) => {
                if let Err(error) = set.check_path(&path).await {
                    error!("check of server path {} failed: {}", path, error);
                }
            }
        }
    }
    debug!("reconcile loop stopped");
}

/// Feeds namespace changes into the reconcile queue, re-establishing the watch
/// after `retry_delay` whenever it breaks. Every established watch, the first
/// one included, is followed by a full scan to cover changes made before it.
pub(crate) async fn watch_loop(
    coordinator: Arc<dyn CoordinationClient>,
    parser: ServerPathParser,
    queue: mpsc::Sender<Reconcile>,
    retry_delay: Duration,
) {
    loop {
        match coordinator.watch().await {
            Ok(mut changes) => {
                debug!("watch server namespace {}", parser.root());
                if queue.send(Reconcile::FullScan).await.is_err() {
                    break;
                }
                while let Some(batch) = changes.next().await {
                    match batch {
                        Ok(events) => {
                            for event in &events {
                                if let Some(request) = reconcile_request(&parser, event) {
                                    if queue.send(request).await.is_err() {
                                        debug!("reconcile queue closed, stop watching {}", parser.root());
                                        return;
                                    }
                                }
                            }
                        }
                        Err(error) => {
                            warn!("watch of {} broken: {}", parser.root(), error);
                            break;
                        }
                    }
                }
            }
            Err(error) => {
                warn!("cannot watch {}: {}", parser.root(), error);
            }
        }
        if queue.is_closed() {
            break;
        }
        warn!("rewatch {} after {:?}", parser.root(), retry_delay);
        tokio::time::sleep(retry_delay).await;
    }
}

pub(crate) async fn scan_ticker(queue: mpsc::Sender<Reconcile>, period: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match queue.try_send(Reconcile::FullScan) {
            Ok(_) => {}
            Err(TrySendError::Full(_)) => {
                debug!("reconcile queue is full, skip scheduled scan");
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
}
