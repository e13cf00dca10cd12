use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::node_addr::NodeAddr;

/// Notified when a cache entry exceeds the timeout. The entry is removed
///  before the callback runs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExpiryHandler: Send + Sync + 'static {
    async fn expired(&self, addr: NodeAddr);
}

/// Tracks connections to endpoints that are not current group members and
///  tears them down after an idle timeout.
///
/// For group members the membership service's failure detection takes care of
///  liveness, so only non-members are tracked. Entries are stamped with their
///  insertion time; a periodic sweep fires the expiry callback for entries
///  older than the (single, adjustable) timeout.
pub struct AgeOutCache {
    entries: Arc<RwLock<FxHashMap<NodeAddr, Instant>>>,
    timeout_millis: Arc<AtomicU64>,
    sweep_handle: JoinHandle<()>,
}

impl Drop for AgeOutCache {
    fn drop(&mut self) {
        self.sweep_handle.abort();
    }
}

impl AgeOutCache {
    pub fn new(timeout: Duration, handler: Arc<dyn ExpiryHandler>) -> AgeOutCache {
        let entries: Arc<RwLock<FxHashMap<NodeAddr, Instant>>> = Default::default();
        let timeout_millis = Arc::new(AtomicU64::new(timeout.as_millis() as u64));

        let sweep_handle = tokio::spawn(Self::sweep_loop(entries.clone(), timeout_millis.clone(), handler));

        AgeOutCache {
            entries,
            timeout_millis,
            sweep_handle,
        }
    }

    async fn sweep_loop(
        entries: Arc<RwLock<FxHashMap<NodeAddr, Instant>>>,
        timeout_millis: Arc<AtomicU64>,
        handler: Arc<dyn ExpiryHandler>,
    ) {
        loop {
            tokio::time::sleep(Duration::from_millis(timeout_millis.load(Ordering::Acquire))).await;
            // the timeout may have been adjusted while sleeping
            let timeout = Duration::from_millis(timeout_millis.load(Ordering::Acquire));

            let now = Instant::now();
            let expired = entries.read().await.iter()
                .filter(|(_, &inserted)| now.duration_since(inserted) >= timeout)
                .map(|(&addr, _)| addr)
                .collect::<Vec<_>>();

            for addr in expired {
                if entries.write().await.remove(&addr).is_some() {
                    debug!("{:?} exceeded the age-out timeout of {:?}", addr, timeout);
                    handler.expired(addr).await;
                }
            }
        }
    }

    pub async fn add(&self, addr: NodeAddr) {
        self.entries.write().await
            .entry(addr)
            .or_insert_with(Instant::now);
    }

    pub async fn remove(&self, addr: &NodeAddr) {
        self.entries.write().await
            .remove(addr);
    }

    pub async fn remove_all(&self, addrs: impl Iterator<Item = &NodeAddr> + Send) {
        let mut entries = self.entries.write().await;
        for addr in addrs {
            entries.remove(addr);
        }
    }

    pub async fn size(&self) -> usize {
        self.entries.read().await.len()
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_millis.store(timeout.as_millis() as u64, Ordering::Release);
    }

    pub async fn print(&self) -> String {
        let now = Instant::now();
        let mut result = String::new();
        for (addr, inserted) in self.entries.read().await.iter() {
            let _ = writeln!(result, "{:?}: {} ms old", addr, now.duration_since(*inserted).as_millis());
        }
        result
    }
}
