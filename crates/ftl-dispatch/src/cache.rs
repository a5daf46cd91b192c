//! Per-endpoint verb clients, kept for a TTL.
//!
//! Lookups take the read lock. A miss takes the write lock and checks again
//! before connecting, so concurrent misses for one endpoint create a single
//! client. Expired entries are replaced on access and removed by the sweeper.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::client::{HttpVerbClient, VerbClient};

pub type ClientFactory = Arc<dyn Fn(&str) -> Arc<dyn VerbClient> + Send + Sync>;

/// Default time a client is kept.
pub const DEFAULT_CLIENT_TTL: Duration = Duration::from_secs(60);

struct Entry {
    client: Arc<dyn VerbClient>,
    expires_at: Instant,
}

pub struct ClientCache {
    ttl: Duration,
    factory: ClientFactory,
    entries: RwLock<HashMap<String, Entry>>,
}

impl ClientCache {
    pub fn new(ttl: Duration, factory: ClientFactory) -> Self {
        Self {
            ttl,
            factory,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// A cache of HTTP clients whose calls time out after `call_timeout`.
    pub fn http(ttl: Duration, call_timeout: Duration) -> Self {
        Self::new(
            ttl,
            Arc::new(move |endpoint: &str| {
                Arc::new(HttpVerbClient::new(endpoint, call_timeout)) as Arc<dyn VerbClient>
            }),
        )
    }

    pub fn get(&self, endpoint: &str) -> Arc<dyn VerbClient> {
        let now = Instant::now();
        {
            let entries = self.entries.read().expect("client cache lock");
            if let Some(entry) = entries.get(endpoint) {
                if entry.expires_at > now {
                    return Arc::clone(&entry.client);
                }
            }
        }

        let mut entries = self.entries.write().expect("client cache lock");
        if let Some(entry) = entries.get(endpoint) {
            if entry.expires_at > now {
                return Arc::clone(&entry.client);
            }
        }
        let client = (self.factory)(endpoint);
        entries.insert(
            endpoint.to_string(),
            Entry {
                client: Arc::clone(&client),
                expires_at: now + self.ttl,
            },
        );
        debug!(endpoint, "verb client created");
        client
    }

    pub fn evict(&self, endpoint: &str) -> bool {
        let removed = self
            .entries
            .write()
            .expect("client cache lock")
            .remove(endpoint)
            .is_some();
        if removed {
            debug!(endpoint, "verb client evicted");
        }
        removed
    }

    /// Drop expired clients. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().expect("client cache lock");
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("client cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep once per TTL until shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.ttl.max(Duration::from_millis(10)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let swept = cache.sweep();
                        if swept > 0 {
                            debug!(swept, "expired verb clients dropped");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("client cache sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::client::VerbRequest;
    use crate::error::DispatchResult;

    struct Nop;

    #[async_trait]
    impl VerbClient for Nop {
        async fn call(&self, _request: VerbRequest) -> DispatchResult<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn counting_cache(ttl: Duration) -> (Arc<ClientCache>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let factory: ClientFactory = Arc::new(move |_: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(Nop) as Arc<dyn VerbClient>
        });
        (Arc::new(ClientCache::new(ttl, factory)), created)
    }

    #[tokio::test(start_paused = true)]
    async fn clients_are_reused_until_they_expire() {
        let (cache, created) = counting_cache(Duration::from_secs(60));
        let a = cache.get("http://a");
        let b = cache.get("http://a");
        assert!(Arc::ptr_eq(&a, &b));
        cache.get("http://b");
        assert_eq!(created.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        let c = cache.get("http://a");
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(created.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn concurrent_misses_create_one_client() {
        let (cache, created) = counting_cache(Duration::from_secs(60));
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.get("http://a"))
            })
            .collect();
        for task in tasks {
            task.join().unwrap();
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn the_sweeper_drops_expired_clients() {
        let (cache, _) = counting_cache(Duration::from_secs(10));
        let (tx, rx) = watch::channel(false);
        let sweeper = cache.spawn_sweeper(rx);
        cache.get("http://a");
        assert_eq!(cache.len(), 1);

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert!(cache.is_empty());

        tx.send(true).unwrap();
        sweeper.await.unwrap();
    }

    #[test]
    fn eviction_forgets_a_client() {
        let (cache, created) = counting_cache(Duration::from_secs(60));
        cache.get("http://a");
        assert!(cache.evict("http://a"));
        assert!(!cache.evict("http://a"));
        cache.get("http://a");
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }
}
