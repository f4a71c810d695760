//! Subscription Router (C2): allocates subscription ids, manages the
//! standing feed subscription plus temporary subscriptions, and
//! dispatches well-known-kind events to registered handlers exactly
//! once per event id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use nostr::{Event, Filter, Kind, SubscriptionId};
use tokio::sync::{mpsc, Mutex};

use crate::dedup::DedupSet;
use crate::error::Result;
use crate::pool::{PoolEvent, RelayPool};
use crate::wire;

const GLOBAL_DEDUP_CAPACITY: usize = 8192;

/// Kinds the router dispatches to a process-wide handler regardless of
/// which subscription they arrived on (C2's "well-known kind handlers").
pub const GLOBAL_KINDS: &[Kind] = &[
    Kind::TextNote,
    Kind::Repost,
    Kind::Reaction,
    Kind::Custom(11),
    Kind::Custom(30311),
    Kind::ZapReceipt,
    Kind::Metadata,
];

pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;
pub type OnEvent = Arc<dyn Fn(Event) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    relays: Vec<String>,
    on_event: Option<OnEvent>,
}

/// Fabricates short, sortable, collision-resistant subscription ids: a
/// base-36 timestamp prefix plus a monotonic per-process suffix.
fn next_subscription_id(counter: &AtomicU32) -> SubscriptionId {
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let suffix = counter.fetch_add(1, Ordering::Relaxed);
    SubscriptionId::new(format!("{}-{}", to_base36(now_ms), to_base36(suffix as u64)))
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap()
}

/// A cancellable handle to a temporary subscription (C2).
pub struct SubscriptionHandle {
    id: SubscriptionId,
    relays: Vec<String>,
    router: Arc<SubscriptionRouter>,
}

impl SubscriptionHandle {
    pub async fn cancel(self) {
        self.router.close_subscription(&self.id, &self.relays).await;
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }
}

/// The standing feed subscription's identity, so `request_feed_change`
/// can no-op when the target is unchanged.
struct FeedState {
    relays: Vec<String>,
    filter: Filter,
    sub_id: Option<SubscriptionId>,
}

pub struct SubscriptionRouter {
    pool: Arc<RelayPool>,
    id_counter: AtomicU32,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    handlers: DashMap<Kind, EventHandler>,
    global_seen: Mutex<DedupSet>,
    feed: Mutex<FeedState>,
}

impl SubscriptionRouter {
    pub fn new(pool: Arc<RelayPool>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            id_counter: AtomicU32::new(0),
            subscriptions: Mutex::new(HashMap::new()),
            handlers: DashMap::new(),
            global_seen: Mutex::new(DedupSet::new(GLOBAL_DEDUP_CAPACITY)),
            feed: Mutex::new(FeedState { relays: Vec::new(), filter: Filter::new(), sub_id: None }),
        })
    }

    /// Drives the router from pool events. Intended to be spawned once
    /// as `tokio::spawn(router.clone().run(inbound_rx))`.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<PoolEvent>) {
        while let Some(event) = inbound.recv().await {
            match event {
                PoolEvent::Message { relay: _, message } => self.dispatch(message).await,
                PoolEvent::Disconnected { relay } => {
                    tracing::debug!(%relay, "connection dropped, subscriptions will be resent on demand");
                }
                PoolEvent::ResumeRequested { relays, filter } => {
                    self.request_feed_change(relays, filter).await;
                }
            }
        }
    }

    async fn dispatch(&self, message: wire::RelayMessage) {
        if let wire::RelayMessage::Event { sub_id, event } = message {
            let event = *event;

            if let Some(sub) = self.subscriptions.lock().await.get(&sub_id) {
                if let Some(cb) = &sub.on_event {
                    cb(event.clone());
                }
            }

            if GLOBAL_KINDS.contains(&event.kind) {
                let mut seen = self.global_seen.lock().await;
                if seen.insert(event.id.to_hex()) {
                    drop(seen);
                    if let Some(handler) = self.handlers.get(&event.kind).map(|h| h.clone()) {
                        handler(event);
                    }
                }
            }
        }
    }

    /// Register the single handler for a well-known kind (§4.2: at most
    /// one handler per kind).
    pub async fn register_handler(&self, kind: Kind, handler: EventHandler) {
        self.handlers.insert(kind, handler);
    }

    /// Whether the pool already has an open (or opening) connection to
    /// `relay`, used by callers deciding whether a rebuild can be skipped
    /// in favor of reusing what's already there.
    pub async fn has_connection(&self, relay: &str) -> bool {
        !matches!(self.pool.state(relay).await, crate::pool::ConnectionState::Disconnected)
    }

    /// Open a temporary subscription across `relays`. The caller cancels
    /// explicitly via the returned handle.
    pub async fn request_temporary_subscription(
        self: &Arc<Self>,
        relays: Vec<String>,
        filters: Vec<Filter>,
        on_event: Option<OnEvent>,
    ) -> Result<SubscriptionHandle> {
        let sub_id = next_subscription_id(&self.id_counter);
        self.subscriptions
            .lock()
            .await
            .insert(sub_id.to_string(), Subscription { id: sub_id.clone(), relays: relays.clone(), on_event });

        let frame = wire::encode_req(&sub_id, &filters);
        for relay in &relays {
            self.pool.adjust_subscription_count(relay, 1);
            if let Err(e) = self.pool.send_frame(relay, frame.clone()).await {
                tracing::warn!(%relay, error = %e, "REQ send failed, continuing with remaining relays");
            }
        }

        Ok(SubscriptionHandle { id: sub_id, relays, router: self.clone() })
    }

    async fn close_subscription(&self, sub_id: &SubscriptionId, relays: &[String]) {
        self.subscriptions.lock().await.remove(&sub_id.to_string());
        let frame = wire::encode_close(sub_id);
        for relay in relays {
            let _ = self.pool.send_frame(relay, frame.clone()).await;
            self.pool.adjust_subscription_count(relay, -1);
        }
    }

    /// At most one standing feed subscription exists at a time. A
    /// request equal to the current `(relays, filter)` is a no-op;
    /// otherwise the prior subscription is closed and a new one opened
    /// over the new relay set, reusing connections.
    pub async fn request_feed_change(self: &Arc<Self>, relays: Vec<String>, filter: Filter) {
        let mut feed = self.feed.lock().await;
        if feed.relays == relays && feed.filter == filter {
            return;
        }

        if let Some(prior_id) = feed.sub_id.take() {
            let frame = wire::encode_close(&prior_id);
            for relay in &feed.relays {
                let _ = self.pool.send_frame(relay, frame.clone()).await;
                self.pool.adjust_subscription_count(relay, -1);
            }
        }

        let sub_id = next_subscription_id(&self.id_counter);
        let req_frame = wire::encode_req(&sub_id, std::slice::from_ref(&filter));
        for relay in &relays {
            self.pool.adjust_subscription_count(relay, 1);
            if let Err(e) = self.pool.send_frame(relay, req_frame.clone()).await {
                tracing::warn!(%relay, error = %e, "feed REQ send failed, continuing with remaining relays");
            }
        }

        feed.relays = relays;
        feed.filter = filter;
        feed.sub_id = Some(sub_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc as tokio_mpsc;

    fn test_router() -> Arc<SubscriptionRouter> {
        let (inbound_tx, _inbound_rx) = tokio_mpsc::channel(16);
        let pool = RelayPool::new(Default::default(), inbound_tx);
        SubscriptionRouter::new(pool)
    }

    #[tokio::test]
    async fn global_handler_fires_once_per_event_id() {
        let router = test_router();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        router.register_handler(Kind::TextNote, Arc::new(move |_event| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        })).await;

        let keys = Keys::generate();
        let event = EventBuilder::text_note("hi").sign_with_keys(&keys).unwrap();
        let message = wire::RelayMessage::Event { sub_id: "sub1".to_string(), event: Box::new(event.clone()) };

        router.dispatch(message.clone()).await;
        router.dispatch(message).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_subscription_stops_receiving_on_event_callbacks() {
        let router = test_router();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let on_event: OnEvent = Arc::new(move |_event| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        let handle = router
            .request_temporary_subscription(vec!["wss://relay.example".to_string()], vec![Filter::new()], Some(on_event))
            .await
            .unwrap();
        let sub_id = handle.id().clone();

        let keys = Keys::generate();
        let event = EventBuilder::new(Kind::Custom(9999), "first").sign_with_keys(&keys).unwrap();
        let message = wire::RelayMessage::Event { sub_id: sub_id.to_string(), event: Box::new(event) };
        router.dispatch(message).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        handle.cancel().await;

        let event2 = EventBuilder::new(Kind::Custom(9999), "second").sign_with_keys(&keys).unwrap();
        let message2 = wire::RelayMessage::Event { sub_id: sub_id.to_string(), event: Box::new(event2) };
        router.dispatch(message2).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
