//! Profile Cache (C4): bounded LRU, TTL-governed, persistent Author
//! store with pin-to-protect semantics and debounced batch fetch.
//!
//! Grounded in the LRU+TTL+batched-fetch pattern used by a profile
//! store elsewhere in the pack, adapted from a GlobalSignal-backed cache
//! to a plain `Mutex<LruCache<..>>` behind an `Arc`, since there is no
//! reactive-signal framework in this dependency graph.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use nostr::{Event, Filter, Kind, PublicKey};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Instant;

use crate::config::ProfileConfig;
use crate::filters;
use crate::router::SubscriptionRouter;
use crate::sanitize::{self, MAX_ABOUT_FIELD};
use crate::traits::KvStorage;
use crate::types::Author;

struct Entry {
    author: Author,
    last_fetched_at: Instant,
    pinned: bool,
}

struct Inner {
    cache: LruCache<String, Entry>,
    pending: HashSet<String>,
    relay_hints: HashSet<String>,
    fetcher_running: bool,
}

pub struct ProfileCache {
    config: ProfileConfig,
    router: Arc<SubscriptionRouter>,
    storage: Arc<dyn KvStorage>,
    inner: Mutex<Inner>,
    updates: broadcast::Sender<String>,
    fetch_request_tx: mpsc::UnboundedSender<()>,
}

impl ProfileCache {
    pub fn new(config: ProfileConfig, router: Arc<SubscriptionRouter>, storage: Arc<dyn KvStorage>) -> Arc<Self> {
        let (updates, _) = broadcast::channel(2048);
        let (fetch_request_tx, fetch_request_rx) = mpsc::unbounded_channel();
        let cap = std::num::NonZeroUsize::new(config.hard_cap.max(1)).unwrap();

        let this = Arc::new(Self {
            config,
            router,
            storage,
            inner: Mutex::new(Inner {
                cache: LruCache::new(cap),
                pending: HashSet::new(),
                relay_hints: HashSet::new(),
                fetcher_running: false,
            }),
            updates,
            fetch_request_tx,
        });
        this.clone().spawn_fetch_debounce(fetch_request_rx);
        this
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<String> {
        self.updates.subscribe()
    }

    /// Never blocks, never fails: returns the cached Author or a
    /// synchronous placeholder.
    pub async fn resolve(&self, pubkey: &str) -> Author {
        let key = pubkey.to_lowercase();
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.cache.get(&key) {
            if entry.last_fetched_at.elapsed() < self.config.ttl {
                return entry.author.clone();
            }
        }
        Author::placeholder(&key)
    }

    pub async fn pin(&self, pubkeys: impl IntoIterator<Item = String>) {
        let mut inner = self.inner.lock().await;
        for pk in pubkeys {
            let key = pk.to_lowercase();
            if let Some(entry) = inner.cache.get_mut(&key) {
                entry.pinned = true;
            }
        }
        self.enforce_caps(&mut inner);
    }

    /// Normalize, filter to absent-or-stale, merge into the pending set,
    /// and (re)arm the fetch debounce. Never cancels an in-flight
    /// fetcher.
    pub async fn request_profiles(
        &self,
        pubkeys: impl IntoIterator<Item = String>,
        relay_hints: impl IntoIterator<Item = String>,
    ) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        for pk in pubkeys {
            let key = pk.to_lowercase();
            let stale = inner
                .cache
                .get(&key)
                .map(|e| now.duration_since(e.last_fetched_at) >= self.config.ttl)
                .unwrap_or(true);
            if stale {
                inner.pending.insert(key);
            }
        }
        inner.relay_hints.extend(relay_hints);
        drop(inner);
        let _ = self.fetch_request_tx.send(());
    }

    fn spawn_fetch_debounce(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<()>) {
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                loop {
                    tokio::select! {
                        more = rx.recv() => if more.is_none() { return },
                        _ = tokio::time::sleep(self.config.fetch_debounce) => break,
                    }
                }
                {
                    let mut inner = self.inner.lock().await;
                    if inner.fetcher_running || inner.pending.is_empty() {
                        continue;
                    }
                    inner.fetcher_running = true;
                }
                self.run_fetcher().await;
            }
        });
    }

    async fn run_fetcher(self: &Arc<Self>) {
        loop {
            let (batch, relays): (Vec<String>, Vec<String>) = {
                let mut inner = self.inner.lock().await;
                let batch: Vec<String> = inner.pending.iter().take(self.config.batch_size).cloned().collect();
                for k in &batch {
                    inner.pending.remove(k);
                }
                (batch, inner.relay_hints.iter().cloned().collect())
            };
            if batch.is_empty() {
                break;
            }

            let pubkeys: Vec<PublicKey> = batch.iter().filter_map(|h| PublicKey::from_hex(h).ok()).collect();
            let filter = filters::profile_filter(&pubkeys);
            let wait = if batch.len() > self.config.large_batch_threshold {
                self.config.large_batch_wait
            } else {
                self.config.batch_wait
            };

            let this = self.clone();
            let on_event: crate::router::OnEvent = Arc::new(move |event: Event| {
                if event.kind == Kind::Metadata {
                    let this = this.clone();
                    tokio::spawn(async move {
                        this.accept(&event).await;
                    });
                }
            });

            tracing::debug!(batch_size = batch.len(), "profile fetch batch requested");
            if let Ok(handle) =
                self.router.request_temporary_subscription(relays.clone(), vec![filter], Some(on_event)).await
            {
                tokio::time::sleep(wait).await;
                handle.cancel().await;
            }

            tokio::time::sleep(self.config.inter_batch_pause).await;
        }

        let mut inner = self.inner.lock().await;
        inner.fetcher_running = false;
        drop(inner);
        self.schedule_persist();
    }

    /// Accept a kind-0 event: only if its `created_at` is monotonic for
    /// the pubkey. Parses and sanitizes the profile JSON per-field.
    pub async fn accept(self: &Arc<Self>, event: &Event) {
        let pubkey = event.pubkey.to_hex().to_lowercase();
        let created_at = event.created_at.as_u64();

        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.cache.peek(&pubkey) {
            if existing.author.last_event_created_at >= created_at {
                return;
            }
        }

        let author = parse_profile_content(&pubkey, &event.content, created_at);
        inner.cache.put(pubkey.clone(), Entry { author, last_fetched_at: Instant::now(), pinned: false });
        self.enforce_caps(&mut inner);
        drop(inner);

        let _ = self.updates.send(pubkey);
        self.schedule_persist();
    }

    fn enforce_caps(&self, inner: &mut Inner) {
        while inner.cache.len() > self.config.hard_cap {
            if let Some((evicted, _)) = inner.cache.pop_lru() {
                tracing::debug!(pubkey = %evicted, "profile cache hard-cap eviction");
                continue;
            }
            break;
        }
        // Soft cap is only enforced while the pinned set is small enough
        // that non-pinned entries remain to evict.
        if inner.cache.len() > self.config.soft_cap {
            let unpinned: Vec<String> =
                inner.cache.iter().filter(|(_, e)| !e.pinned).map(|(k, _)| k.clone()).collect();
            let excess = inner.cache.len() - self.config.soft_cap;
            for key in unpinned.into_iter().take(excess) {
                inner.cache.pop(&key);
                tracing::debug!(pubkey = %key, "profile cache soft-cap eviction");
            }
        }
    }

    fn schedule_persist(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.config.persist_debounce).await;
            let inner = this.inner.lock().await;
            let mut entries: Vec<&Entry> = inner.cache.iter().map(|(_, e)| e).collect();
            entries.sort_by_key(|e| !e.pinned);
            let snapshot: Vec<&Author> = entries.iter().take(this.config.persist_size).map(|e| &e.author).collect();
            if let Ok(json) = serde_json::to_vec(&snapshot) {
                drop(inner);
                let _ = this.storage.put("profile:authors", json).await;
            }
        });
    }

    /// Restore from storage; runs once at startup.
    pub async fn restore(&self) {
        if let Ok(Some(bytes)) = self.storage.get("profile:authors").await {
            if let Ok(authors) = serde_json::from_slice::<Vec<Author>>(&bytes) {
                let mut inner = self.inner.lock().await;
                for author in authors {
                    let key = author.id.clone();
                    inner.cache.put(key, Entry { author, last_fetched_at: Instant::now(), pinned: false });
                }
            }
        }
    }
}

fn parse_profile_content(pubkey: &str, content: &str, created_at: u64) -> Author {
    let json: Value = serde_json::from_str(content).unwrap_or(Value::Null);
    let field = |name: &str, max: usize| -> Option<String> {
        json.get(name).and_then(Value::as_str).and_then(|s| sanitize::sanitize_profile_field(s, max))
    };

    let name = field("name", 16);
    let display_name_raw = field("display_name", 64);
    let short = pubkey.get(0..8).unwrap_or(pubkey).to_string();
    let display_name = display_name_raw
        .filter(|s| !s.is_empty())
        .or_else(|| name.clone())
        .unwrap_or_else(|| format!("{short}…"));

    Author {
        id: pubkey.to_string(),
        username: name.unwrap_or_else(|| format!("{short}…")),
        display_name,
        avatar_url: field("picture", 512),
        about: field("about", MAX_ABOUT_FIELD.min(500)),
        nip05: field("nip05", 128),
        website: field("website", 256),
        lud16: field("lud16", 128),
        banner: field("banner", 512),
        pronouns: field("pronouns", 32),
        last_event_created_at: created_at,
    }
}

/// Build a well-known-kind filter for the Subscription Router's global
/// kind-0 handler, used by the pool's profile-cache-driven auto-accept
/// path (kind-0 events arriving on any subscription, not just the
/// batched fetcher's temporary one).
pub fn global_metadata_filter() -> Filter {
    Filter::new().kind(Kind::Metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfileConfig;
    use nostr::{EventBuilder, Keys, Timestamp};

    struct NullStorage;

    #[async_trait::async_trait]
    impl KvStorage for NullStorage {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, crate::error::CoreError> {
            Ok(None)
        }
        async fn put(&self, _key: &str, _value: Vec<u8>) -> Result<(), crate::error::CoreError> {
            Ok(())
        }
    }

    fn metadata_event(keys: &Keys, content: &str, created_at: u64) -> Event {
        EventBuilder::new(Kind::Metadata, content)
            .custom_created_at(Timestamp::from(created_at))
            .sign_with_keys(keys)
            .unwrap()
    }

    fn test_cache() -> Arc<ProfileCache> {
        let (inbound_tx, _inbound_rx) = mpsc::channel(16);
        let pool = crate::pool::RelayPool::new(Default::default(), inbound_tx);
        let router = SubscriptionRouter::new(pool);
        ProfileCache::new(ProfileConfig::default(), router, Arc::new(NullStorage))
    }

    #[tokio::test]
    async fn accept_is_monotonic_on_created_at() {
        let cache = test_cache();
        let keys = Keys::generate();

        let newer = metadata_event(&keys, r#"{"name":"alice"}"#, 200);
        cache.accept(&newer).await;

        let older = metadata_event(&keys, r#"{"name":"bob"}"#, 100);
        cache.accept(&older).await;

        let key = keys.public_key().to_hex().to_lowercase();
        let author = cache.inner.lock().await.cache.peek(&key).unwrap().author.clone();
        assert_eq!(author.username, "alice");
    }

    #[test]
    fn parse_profile_content_falls_back_to_name_then_shortened_pubkey() {
        let pubkey = "abcdef0123456789";
        let with_display = parse_profile_content(pubkey, r#"{"display_name":"Alice B"}"#, 1);
        assert_eq!(with_display.display_name, "Alice B");

        let name_only = parse_profile_content(pubkey, r#"{"name":"alice"}"#, 1);
        assert_eq!(name_only.display_name, "alice");

        let neither = parse_profile_content(pubkey, "{}", 1);
        assert_eq!(neither.display_name, "abcdef01…");
        assert_eq!(neither.username, "abcdef01…");
    }
}
