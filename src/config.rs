use std::time::Duration;

/// Full configuration for a [`crate::NostrCore`] instance.
///
/// Every literal below corresponds to a specific timing/cap constant named
/// in the design: backoff, idle timeouts, debounce windows, LRU caps and
/// TTLs. Call sites should prefer overriding individual nested structs
/// (e.g. `CoreConfig { pool: PoolConfig { idle_timeout: .., ..Default::default() }, ..Default::default() }`)
/// rather than reconstructing the whole tree.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub pool: PoolConfig,
    pub feed: FeedConfig,
    pub profile: ProfileConfig,
    pub counts: CountsConfig,
    pub thread: ThreadConfig,
    pub notifications: NotificationsConfig,
    pub discovery: DiscoveryConfig,
    pub http: HttpConfig,
    pub storage_prefix: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            feed: FeedConfig::default(),
            profile: ProfileConfig::default(),
            counts: CountsConfig::default(),
            thread: ThreadConfig::default(),
            notifications: NotificationsConfig::default(),
            discovery: DiscoveryConfig::default(),
            http: HttpConfig::default(),
            storage_prefix: "nostr-core".to_string(),
        }
    }
}

/// Per-connection backoff and idle-close timing (C1 Relay Pool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Initial reconnect backoff.
    pub backoff_initial: Duration,
    /// Backoff ceiling.
    pub backoff_cap: Duration,
    /// Sustained-open duration after which backoff resets to `backoff_initial`.
    pub backoff_reset_after: Duration,
    /// A connection with zero active subscriptions for this long becomes
    /// eligible to close (never while a subscription still references it).
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            backoff_initial: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            backoff_reset_after: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Feed Aggregator batching, trim and snapshot timing (C3).
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Debounce for draining the lock-free ingestion queue.
    pub flush_debounce: Duration,
    /// Debounce for recomputing the displayed projection.
    pub project_debounce: Duration,
    /// `allNotes` is trimmed to this many entries after any insertion.
    pub max_notes: usize,
    /// Size of the persisted snapshot (top-N by timestamp).
    pub snapshot_size: usize,
    /// Debounce for writing the snapshot to storage.
    pub snapshot_debounce: Duration,
    /// Window after the first note is displayed during which late
    /// arrivals still bypass the pending queue. This is an observed
    /// relay-latency accommodation, not a protocol requirement, so it
    /// can be turned off entirely.
    pub grace_window: Option<Duration>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            flush_debounce: Duration::from_millis(120),
            project_debounce: Duration::from_millis(150),
            max_notes: 1000,
            snapshot_size: 200,
            snapshot_debounce: Duration::from_secs(2),
            grace_window: Some(Duration::from_secs(5)),
        }
    }
}

/// Profile Cache LRU/TTL/batch-fetch timing (C4).
#[derive(Debug, Clone)]
pub struct ProfileConfig {
    /// Soft cap: eviction target under normal pressure.
    pub soft_cap: usize,
    /// Hard cap: only crossed while the pinned set itself is large.
    pub hard_cap: usize,
    /// Entries older than this are stale and re-requested on next resolve.
    pub ttl: Duration,
    /// Debounce before a batched fetcher coroutine is scheduled.
    pub fetch_debounce: Duration,
    /// Max pubkeys drained into one relay subscription per batch.
    pub batch_size: usize,
    /// Wait for kind-0 replies when the batch holds `batch_size` or fewer.
    pub batch_wait: Duration,
    /// Wait for kind-0 replies when the batch exceeds `large_batch_threshold`.
    pub large_batch_wait: Duration,
    /// Batch size above which `large_batch_wait` applies instead of `batch_wait`.
    pub large_batch_threshold: usize,
    /// Pause between successive batches while pending is non-empty.
    pub inter_batch_pause: Duration,
    /// Debounce before the persistence writer serializes the cache.
    pub persist_debounce: Duration,
    /// Number of entries persisted (pinned first).
    pub persist_size: usize,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            soft_cap: 2000,
            hard_cap: 3000,
            ttl: Duration::from_secs(7 * 24 * 60 * 60),
            fetch_debounce: Duration::from_millis(400),
            batch_size: 80,
            batch_wait: Duration::from_secs(5),
            large_batch_wait: Duration::from_secs(12),
            large_batch_threshold: 50,
            inter_batch_pause: Duration::from_millis(200),
            persist_debounce: Duration::from_secs(2),
            persist_size: 1500,
        }
    }
}

/// Counts Aggregator subscription-phasing and flush timing (C5).
#[derive(Debug, Clone)]
pub struct CountsConfig {
    /// Debounce before the interest set's subscriptions are rebuilt.
    pub subscription_debounce: Duration,
    /// Delay before phase-2 (reactions/zaps) subscriptions are issued,
    /// relative to phase-1 (replies).
    pub phase2_delay: Duration,
    /// Limit on the phase-2 reaction subscription.
    pub reaction_limit: usize,
    /// Limit on the phase-2 zap-receipt subscription.
    pub zap_limit: usize,
    /// Debounce for draining queued count-affecting events.
    pub flush_debounce: Duration,
    /// Hard cap on flush debounce: a flush always runs by this deadline
    /// even under continuous re-triggering.
    pub flush_hard_cap: Duration,
}

impl Default for CountsConfig {
    fn default() -> Self {
        Self {
            subscription_debounce: Duration::from_millis(800),
            phase2_delay: Duration::from_millis(600),
            reaction_limit: 2000,
            zap_limit: 200,
            flush_debounce: Duration::from_millis(80),
            flush_hard_cap: Duration::from_millis(300),
        }
    }
}

/// Thread Builder missing-parent fetch timing (C6).
#[derive(Debug, Clone)]
pub struct ThreadConfig {
    /// Timeout for a one-off missing-parent fetch.
    pub parent_fetch_timeout: Duration,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            parent_fetch_timeout: Duration::from_secs(12),
        }
    }
}

/// Notifications Aggregator subscription windows (C7).
#[derive(Debug, Clone)]
pub struct NotificationsConfig {
    /// Lookback window for the primary mentions/replies/reactions/zaps
    /// subscription.
    pub lookback: Duration,
    /// Limit on the primary subscription.
    pub primary_limit: usize,
    /// Timeout for the one-off topic-id discovery subscription.
    pub topic_id_timeout: Duration,
    /// Capacity of the backpressure buffer on the notification stream.
    pub stream_buffer: usize,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            lookback: Duration::from_secs(7 * 24 * 60 * 60),
            primary_limit: 500,
            topic_id_timeout: Duration::from_secs(3),
            stream_buffer: 2048,
        }
    }
}

/// Discovery Catalog refresh timing (C8).
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Staleness window before `refresh_if_stale` re-fetches.
    pub ttl: Duration,
    /// Timeout for the NIP-65 relay-list fetch.
    pub relay_list_timeout: Duration,
    /// Timeout for the NIP-66 relay-monitor fallback subscription.
    pub monitor_timeout: Duration,
    /// Limit on the relay-monitor fallback subscription.
    pub monitor_limit: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(6 * 60 * 60),
            relay_list_timeout: Duration::from_secs(5),
            monitor_timeout: Duration::from_secs(12),
            monitor_limit: 500,
        }
    }
}

/// HTTP collaborator timeouts (NIP-11 descriptor fetch, REST discovery).
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub request_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(12),
        }
    }
}
