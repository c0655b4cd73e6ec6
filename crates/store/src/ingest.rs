use std::sync::Arc;
use std::time::Duration;

use keel_kubehub::WatchEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::coalesce::Coalescer;
use crate::Store;

fn flush(store: &Store, coalescer: &mut Coalescer) {
    let batch = coalescer.drain_ready();
    if batch.is_empty() {
        return;
    }
    let n = batch.len();
    for ev in batch {
        store.apply(ev);
    }
    let epoch = store.publish_tenants();
    debug!(events = n, epoch, "ingest batch applied");
}

/// Spawn the ingest loop: watch events are coalesced by object key and applied
/// to `store` on an 8ms tick, or as soon as `cap` distinct keys are pending.
/// Relists and sync markers flush pending events first, so a relist never
/// races an older queued event and readiness never precedes the initial list.
pub fn spawn_ingest(store: Arc<Store>, cap: usize) -> (mpsc::Sender<WatchEvent>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<WatchEvent>(cap.max(1));
    let handle = tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut ticker = tokio::time::interval(Duration::from_millis(8));
        let mut early_flushes: u64 = 0;
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(WatchEvent::Synced(kind)) => {
                            flush(&store, &mut coalescer);
                            store.mark_synced(kind);
                        }
                        Some(ev @ WatchEvent::Replaced(..)) => {
                            flush(&store, &mut coalescer);
                            store.apply(ev);
                            store.publish_tenants();
                        }
                        Some(ev) => {
                            if coalescer.push(ev) {
                                early_flushes += 1;
                                metrics::counter!("store_coalescer_full_total", 1u64);
                                flush(&store, &mut coalescer);
                            }
                        }
                        None => {
                            debug!("event channel closed; draining and exiting ingest loop");
                            flush(&store, &mut coalescer);
                            break;
                        }
                    }
                }
                _ = ticker.tick() => flush(&store, &mut coalescer),
            }
        }
        info!(early_flushes, "ingest loop stopped");
    });
    (tx, handle)
}
