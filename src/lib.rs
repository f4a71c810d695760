//! # Nostr Relay & Cache Core
//!
//! The client-side relay connection and local cache layer for a
//! decentralized social client, powered by:
//! - **rust-nostr** (`nostr`): event/filter types, canonical id/sig, tag parsing
//! - **tokio-tungstenite**: raw per-relay WebSocket connections
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          NostrCore                            │
//! │  ┌─────────┐  ┌───────────┐  ┌──────┐  ┌─────────┐  ┌──────┐ │
//! │  │ C1 Pool │─▶│ C2 Router │─▶│  C3  │  │   C4    │  │  C5  │ │
//! │  │         │  │           │  │ Feed │  │ Profile │  │Counts│ │
//! │  └─────────┘  └─────┬─────┘  └──────┘  └─────────┘  └──────┘ │
//! │                     │        ┌──────┐  ┌─────────┐  ┌──────┐ │
//! │                     ├───────▶│  C6  │  │   C7    │  │  C8  │ │
//! │                     │        │Thread│  │ Notifs  │  │Discov│ │
//! │                     │        └──────┘  └─────────┘  └──────┘ │
//! │                     └───────▶ C9 Publisher (via Signer)       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every component other than the pool and router is independently
//! constructible and testable behind the [`traits::Signer`],
//! [`traits::KvStorage`], and [`traits::HttpClient`] boundaries.

pub mod bolt11;
pub mod config;
pub mod counts;
pub mod dedup;
pub mod discovery;
pub mod error;
pub mod feed;
pub mod filters;
pub mod nip10;
pub mod notifications;
pub mod pool;
pub mod profile;
pub mod publisher;
pub mod router;
pub mod sanitize;
pub mod thread;
pub mod traits;
pub mod types;
pub mod wire;

use std::sync::Arc;

use nostr::PublicKey;
use tokio::sync::mpsc;

pub use config::CoreConfig;
pub use error::{CoreError, Result};

use counts::CountsAggregator;
use discovery::DiscoveryCatalog;
use feed::FeedAggregator;
use notifications::NotificationsAggregator;
use pool::RelayPool;
use profile::ProfileCache;
use publisher::Publisher;
use router::SubscriptionRouter;
use thread::ThreadReplyCache;
use traits::{HttpClient, KvStorage, Signer};

/// The root object tying together the pool, router, and every cache
/// component (§9 "Global mutable state": one root constructed once, a
/// single `shutdown()` drains it).
pub struct NostrCore {
    pub pool: Arc<RelayPool>,
    pub router: Arc<SubscriptionRouter>,
    pub feed: Arc<FeedAggregator>,
    pub profiles: Arc<ProfileCache>,
    pub counts: Arc<CountsAggregator>,
    pub threads: Arc<ThreadReplyCache>,
    pub notifications: Arc<NotificationsAggregator>,
    pub discovery: Arc<DiscoveryCatalog>,
    pub publisher: Arc<Publisher>,
}

impl NostrCore {
    /// Constructs the full component graph and registers the well-known
    /// kind handlers. Does not open any connections; callers drive the
    /// pool via [`SubscriptionRouter::request_feed_change`] and the
    /// other components' `start`/`open_*` entry points.
    pub async fn init(
        config: CoreConfig,
        current_user: PublicKey,
        signer: Arc<dyn Signer>,
        storage: Arc<dyn KvStorage>,
        http: Arc<dyn HttpClient>,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(4096);
        let pool = RelayPool::new(config.pool.clone(), inbound_tx);
        let router = SubscriptionRouter::new(pool.clone());
        tokio::spawn(router.clone().run(inbound_rx));

        let feed = FeedAggregator::new(config.feed.clone(), current_user, router.clone(), storage.clone());
        let profiles = ProfileCache::new(config.profile.clone(), router.clone(), storage.clone());
        let counts = CountsAggregator::new(config.counts.clone(), router.clone());
        let threads = ThreadReplyCache::new(config.thread.clone(), router.clone());
        let notifications =
            NotificationsAggregator::new(config.notifications.clone(), current_user, router.clone(), storage.clone());
        let discovery = DiscoveryCatalog::new(config.discovery.clone(), router.clone(), http, storage.clone());
        let publisher = Publisher::new(signer, pool.clone());

        let feed_for_notes = feed.clone();
        router
            .register_handler(nostr::Kind::TextNote, Arc::new(move |event| feed_for_notes.ingest(event)))
            .await;
        let feed_for_reposts = feed.clone();
        router
            .register_handler(nostr::Kind::Repost, Arc::new(move |event| feed_for_reposts.ingest(event)))
            .await;
        let feed_for_topics = feed.clone();
        router
            .register_handler(nostr::Kind::Custom(11), Arc::new(move |event| feed_for_topics.ingest(event)))
            .await;
        let profiles_for_metadata = profiles.clone();
        router
            .register_handler(
                nostr::Kind::Metadata,
                Arc::new(move |event| {
                    let profiles = profiles_for_metadata.clone();
                    tokio::spawn(async move { profiles.accept(&event).await });
                }),
            )
            .await;

        let resume_feed = feed.clone();
        pool.set_resume_provider(move || resume_feed.resume_target()).await;

        feed.restore().await;
        profiles.restore().await;
        notifications.restore_seen().await;
        discovery.restore().await;

        tracing::info!("nostr core initialized");
        Arc::new(Self { pool, router, feed, profiles, counts, threads, notifications, discovery, publisher })
    }

    /// Closes every open connection and lets spawned tasks drain.
    pub async fn shutdown(&self) {
        tracing::info!("nostr core shutting down");
        self.pool.shutdown().await;
    }
}
