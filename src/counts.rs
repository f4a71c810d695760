//! Counts Aggregator (C5): per-note reply/reaction/zap aggregates for
//! the currently-visible note set, fetched via dedicated per-relay
//! subscriptions so the main feed relays are never pressured.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nostr::{Event, EventId, Kind};
use tokio::sync::{mpsc, Mutex};

use crate::bolt11;
use crate::config::CountsConfig;
use crate::dedup::DedupSet;
use crate::filters;
use crate::nip10;
use crate::router::SubscriptionRouter;
use crate::types::NoteCounts;

struct Inner {
    interest: HashMap<String, Vec<String>>, // noteId -> hint relay urls
    counts: HashMap<String, NoteCounts>,
    processed: DedupSet,
    queue: Vec<Event>,
    /// New note ids added to `interest` since the last rebuild, used by
    /// the resubscription-suppression rule.
    new_since_rebuild: usize,
}

pub struct CountsAggregator {
    config: CountsConfig,
    router: Arc<SubscriptionRouter>,
    inner: Mutex<Inner>,
    subscribe_tx: mpsc::UnboundedSender<()>,
    flush_tx: mpsc::UnboundedSender<()>,
    updates: tokio::sync::broadcast::Sender<String>,
}

impl CountsAggregator {
    pub fn new(config: CountsConfig, router: Arc<SubscriptionRouter>) -> Arc<Self> {
        let (subscribe_tx, subscribe_rx) = mpsc::unbounded_channel();
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let (updates, _) = tokio::sync::broadcast::channel(1024);

        let this = Arc::new(Self {
            config,
            router,
            inner: Mutex::new(Inner {
                interest: HashMap::new(),
                counts: HashMap::new(),
                processed: DedupSet::new(16_384),
                queue: Vec::new(),
                new_since_rebuild: 0,
            }),
            subscribe_tx,
            flush_tx,
            updates,
        });
        this.clone().spawn_subscription_debounce(subscribe_rx);
        this.clone().spawn_flush_debounce(flush_rx);
        this
    }

    pub fn subscribe_updates(&self) -> tokio::sync::broadcast::Receiver<String> {
        self.updates.subscribe()
    }

    /// Union the interest set's feed/thread/topic sources and schedule a
    /// debounced subscription rebuild.
    pub async fn set_interest(&self, note_id: String, hint_relays: Vec<String>) {
        {
            let mut inner = self.inner.lock().await;
            let is_new = !inner.interest.contains_key(&note_id);
            inner.interest.entry(note_id).or_default().extend(hint_relays);
            if is_new {
                inner.new_since_rebuild += 1;
            }
        }
        let _ = self.subscribe_tx.send(());
    }

    pub async fn counts_for(&self, note_id: &str) -> NoteCounts {
        self.inner.lock().await.counts.get(note_id).cloned().unwrap_or_default()
    }

    fn spawn_subscription_debounce(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<()>) {
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                loop {
                    tokio::select! {
                        more = rx.recv() => if more.is_none() { return },
                        _ = tokio::time::sleep(self.config.subscription_debounce) => break,
                    }
                }
                self.rebuild_subscriptions().await;
            }
        });
    }

    async fn rebuild_subscriptions(self: &Arc<Self>) {
        let (by_relay, delta) = {
            let inner = self.inner.lock().await;
            let mut map: HashMap<String, Vec<EventId>> = HashMap::new();
            for (note_id, relays) in &inner.interest {
                let Ok(id) = EventId::from_hex(note_id) else { continue };
                for relay in relays {
                    let bucket = map.entry(relay.clone()).or_default();
                    if bucket.len() < 200 {
                        bucket.push(id);
                    }
                }
            }
            (map, inner.new_since_rebuild)
        };

        // A resubscription is suppressed when the set delta is small and
        // connections already exist (§4.5): the existing subscriptions
        // already cover the bulk of the interest set.
        if delta < 5 {
            let mut has_existing_connection = false;
            for relay in by_relay.keys() {
                if self.router.has_connection(relay).await {
                    has_existing_connection = true;
                    break;
                }
            }
            if has_existing_connection {
                tracing::debug!(delta, "counts resubscription suppressed");
                return;
            }
        }
        self.inner.lock().await.new_since_rebuild = 0;

        tracing::debug!(relays = by_relay.len(), delta, "counts rebuilding subscriptions");
        for (relay, ids) in by_relay {
            let reply_filter = filters::reply_filter(&ids, 2000);
            let router = self.router.clone();
            let this = self.clone();
            let relay_phase1 = relay.clone();
            let on_event = make_event_sink(this.clone());
            if let Ok(handle) =
                router.request_temporary_subscription(vec![relay_phase1], vec![reply_filter], Some(on_event)).await
            {
                std::mem::forget(handle); // kept open; C5 reuses the dedicated connection
            }

            let phase2_delay = self.config.phase2_delay;
            let this2 = self.clone();
            let relay2 = relay.clone();
            let ids2 = ids.clone();
            let reaction_limit = self.config.reaction_limit;
            let zap_limit = self.config.zap_limit;
            tokio::spawn(async move {
                tokio::time::sleep(phase2_delay).await;
                let reaction_filter = filters::reaction_filter(&ids2, reaction_limit);
                let zap_filter = filters::zap_filter(&ids2, zap_limit);
                let on_event = make_event_sink(this2.clone());
                if let Ok(handle) = this2
                    .router
                    .request_temporary_subscription(vec![relay2], vec![reaction_filter, zap_filter], Some(on_event))
                    .await
                {
                    std::mem::forget(handle);
                }
            });
        }
    }

    async fn enqueue(&self, event: Event) {
        self.inner.lock().await.queue.push(event);
        let _ = self.flush_tx.send(());
    }

    fn spawn_flush_debounce(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<()>) {
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                let deadline = tokio::time::Instant::now() + self.config.flush_hard_cap;
                loop {
                    tokio::select! {
                        more = rx.recv() => if more.is_none() { return },
                        _ = tokio::time::sleep(self.config.flush_debounce) => break,
                        _ = tokio::time::sleep_until(deadline) => break,
                    }
                }
                self.flush().await;
            }
        });
    }

    async fn flush(&self) {
        let mut inner = self.inner.lock().await;
        let events: Vec<Event> = inner.queue.drain(..).collect();
        let mut touched: HashSet<String> = HashSet::new();
        for event in events {
            if !inner.processed.insert(event.id.to_hex()) {
                continue;
            }
            let id = match event.kind {
                Kind::TextNote => apply_reply(&mut inner.counts, &event),
                Kind::Reaction => apply_reaction(&mut inner.counts, &event),
                Kind::ZapReceipt => apply_zap(&mut inner.counts, &event),
                _ => None,
            };
            touched.extend(id);
        }
        drop(inner);
        tracing::debug!(touched = touched.len(), "counts flush");
        for id in touched {
            let _ = self.updates.send(id);
        }
    }
}

fn make_event_sink(this: Arc<CountsAggregator>) -> crate::router::OnEvent {
    Arc::new(move |event: Event| {
        let this = this.clone();
        tokio::spawn(async move {
            this.enqueue(event).await;
        });
    })
}

fn apply_reply(counts: &mut HashMap<String, NoteCounts>, event: &Event) -> Option<String> {
    let parent = nip10::direct_parent(event)?;
    let id = parent.to_hex();
    counts.entry(id.clone()).or_default().reply_count += 1;
    Some(id)
}

fn apply_reaction(counts: &mut HashMap<String, NoteCounts>, event: &Event) -> Option<String> {
    let target = last_e_tag(event)?;
    let emoji = classify_reaction_content(&event.content)?;

    let id = target.to_hex();
    let entry = counts.entry(id.clone()).or_default();
    let authors = entry.reactions.entry(emoji.clone()).or_default();
    let author = event.pubkey.to_hex();
    if !authors.contains(&author) {
        authors.push(author);
    }

    if emoji.starts_with(':') && emoji.ends_with(':') {
        if let Some(url) = custom_emoji_url(event, &emoji) {
            entry.custom_emoji_urls.insert(emoji, url);
        }
    }
    Some(id)
}

fn classify_reaction_content(content: &str) -> Option<String> {
    match content {
        "+" => Some("❤️".to_string()),
        "-" => None,
        c if c.starts_with(':') && c.ends_with(':') && c.len() > 1 => Some(c.to_string()),
        c if c.chars().count() <= 4 => Some(c.to_string()),
        c => Some(c.to_string()),
    }
}

fn custom_emoji_url(event: &Event, shortcode: &str) -> Option<String> {
    let bare = shortcode.trim_matches(':');
    event.tags.iter().find_map(|t| {
        let slice = t.as_slice();
        if slice.first().map(String::as_str) == Some("emoji") && slice.get(1).map(String::as_str) == Some(bare) {
            slice.get(2).cloned()
        } else {
            None
        }
    })
}

fn apply_zap(counts: &mut HashMap<String, NoteCounts>, event: &Event) -> Option<String> {
    let target = last_e_tag(event)?;

    let description = event
        .tags
        .iter()
        .find(|t| t.as_slice().first().map(String::as_str) == Some("description"))
        .and_then(|t| t.as_slice().get(1).cloned());

    let description_json: Option<serde_json::Value> =
        description.as_deref().and_then(|d| serde_json::from_str(d).ok());

    let sender = description_json
        .as_ref()
        .and_then(|v| v.get("pubkey"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| event.pubkey.to_hex());

    let bolt11 = event
        .tags
        .iter()
        .find(|t| t.as_slice().first().map(String::as_str) == Some("bolt11"))
        .and_then(|t| t.as_slice().get(1).cloned());

    let amount_sats = bolt11
        .as_deref()
        .and_then(bolt11::decode_amount_sats)
        .or_else(|| {
            description_json
                .as_ref()
                .and_then(|v| v.get("amount"))
                .and_then(|v| v.as_u64())
                .map(|millisats| millisats / 1000)
        })
        .unwrap_or(0);

    let id = target.to_hex();
    let entry = counts.entry(id.clone()).or_default();
    entry.zap_sats_total += amount_sats;
    *entry.zap_sats_by_author.entry(sender.clone()).or_insert(0) += amount_sats;
    if !entry.zap_authors.contains(&sender) {
        entry.zap_authors.push(sender);
    }
    Some(id)
}

fn last_e_tag(event: &Event) -> Option<EventId> {
    event
        .tags
        .iter()
        .filter(|t| t.as_slice().first().map(String::as_str) == Some("e"))
        .filter_map(|t| t.as_slice().get(1).and_then(|id| EventId::from_hex(id).ok()))
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys, Tag};

    #[test]
    fn classifies_plus_as_heart() {
        assert_eq!(classify_reaction_content("+"), Some("❤️".to_string()));
    }

    #[test]
    fn classifies_minus_as_none() {
        assert_eq!(classify_reaction_content("-"), None);
    }

    #[test]
    fn classifies_shortcode_passthrough() {
        assert_eq!(classify_reaction_content(":fire:"), Some(":fire:".to_string()));
    }

    #[test]
    fn apply_reply_credits_direct_parent() {
        let keys = Keys::generate();
        let parent = EventId::all_zeros();
        let tag = Tag::parse(["e", &parent.to_hex(), "", "reply"]).unwrap();
        let reply = EventBuilder::text_note("hi").tags([tag]).sign_with_keys(&keys).unwrap();

        let mut counts = HashMap::new();
        apply_reply(&mut counts, &reply);
        assert_eq!(counts.get(&parent.to_hex()).unwrap().reply_count, 1);
    }

    #[test]
    fn apply_reaction_records_author_once() {
        let keys = Keys::generate();
        let target = EventId::all_zeros();
        let tag = Tag::parse(["e", &target.to_hex()]).unwrap();
        let reaction = EventBuilder::new(Kind::Reaction, "+").tags([tag]).sign_with_keys(&keys).unwrap();

        let mut counts = HashMap::new();
        apply_reaction(&mut counts, &reaction);
        apply_reaction(&mut counts, &reaction);
        let entry = counts.get(&target.to_hex()).unwrap();
        assert_eq!(entry.reactions.get("❤️").unwrap().len(), 1);
    }
}
