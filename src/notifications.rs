//! Notifications Aggregator (C7): primary mentions/replies/reactions/
//! zaps subscription plus a topic-reply secondary, consolidated and
//! self-filtered into a seen-tracked notification list.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nostr::{Event, EventId, Kind, PublicKey};
use tokio::sync::{broadcast, oneshot, Mutex};

use crate::config::NotificationsConfig;
use crate::filters;
use crate::nip10;
use crate::router::SubscriptionRouter;
use crate::traits::KvStorage;
use crate::types::{Notification, NotificationKind};

struct Inner {
    by_target: HashMap<(NotificationKind, String), Notification>,
    seen: HashSet<String>,
    my_topic_ids: HashSet<String>,
    /// target note id -> author pubkey, resolved on demand for the
    /// self-filter; `None` while a resolution is in flight.
    target_author: HashMap<String, Option<String>>,
}

pub struct NotificationsAggregator {
    config: NotificationsConfig,
    current_user: PublicKey,
    router: Arc<SubscriptionRouter>,
    storage: Arc<dyn KvStorage>,
    inner: Mutex<Inner>,
    updates: broadcast::Sender<()>,
    relays: Mutex<Vec<String>>,
}

impl NotificationsAggregator {
    pub fn new(
        config: NotificationsConfig,
        current_user: PublicKey,
        router: Arc<SubscriptionRouter>,
        storage: Arc<dyn KvStorage>,
    ) -> Arc<Self> {
        let (updates, _) = broadcast::channel(config.stream_buffer.max(16));
        Arc::new(Self {
            config,
            current_user,
            router,
            storage,
            inner: Mutex::new(Inner {
                by_target: HashMap::new(),
                seen: HashSet::new(),
                my_topic_ids: HashSet::new(),
                target_author: HashMap::new(),
            }),
            updates,
            relays: Mutex::new(Vec::new()),
        })
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<()> {
        self.updates.subscribe()
    }

    pub async fn restore_seen(&self) {
        if let Ok(Some(bytes)) = self.storage.get("notifications:seen").await {
            if let Ok(ids) = serde_json::from_slice::<Vec<String>>(&bytes) {
                self.inner.lock().await.seen.extend(ids);
            }
        }
    }

    /// Opens the primary subscription, then the topic-id discovery
    /// one-off, then (if any topics exist) the secondary subscription.
    pub async fn start(self: &Arc<Self>, relays: Vec<String>) {
        tracing::debug!(relays = relays.len(), "starting notifications aggregator");
        *self.relays.lock().await = relays.clone();
        let since = filters::since_duration_ago(self.config.lookback.as_secs());
        let primary = filters::notifications_filter(self.current_user, since, self.config.primary_limit);

        let this = self.clone();
        let on_primary: crate::router::OnEvent = Arc::new(move |event: Event| {
            let this = this.clone();
            tokio::spawn(async move { this.ingest(event).await });
        });
        let _ = self.router.request_temporary_subscription(relays.clone(), vec![primary], Some(on_primary)).await;

        self.clone().discover_topics_then_subscribe(relays).await;
    }

    async fn discover_topics_then_subscribe(self: Arc<Self>, relays: Vec<String>) {
        let topics_filter = filters::own_topics_filter(self.current_user, 200);
        let collected: Arc<Mutex<Vec<EventId>>> = Arc::new(Mutex::new(Vec::new()));
        let collected_cb = collected.clone();
        let on_event: crate::router::OnEvent = Arc::new(move |event: Event| {
            let collected_cb = collected_cb.clone();
            tokio::spawn(async move {
                collected_cb.lock().await.push(event.id);
            });
        });

        if let Ok(handle) =
            self.router.request_temporary_subscription(relays.clone(), vec![topics_filter], Some(on_event)).await
        {
            tokio::time::sleep(self.config.topic_id_timeout).await;
            handle.cancel().await;
        }

        let topic_ids = collected.lock().await.clone();
        tracing::debug!(topics = topic_ids.len(), "own-topic discovery complete");
        if topic_ids.is_empty() {
            return;
        }
        {
            let mut inner = self.inner.lock().await;
            inner.my_topic_ids.extend(topic_ids.iter().map(|id| id.to_hex()));
        }

        let secondary = filters::topic_replies_filter(&topic_ids, 200);
        let this = self.clone();
        let on_secondary: crate::router::OnEvent = Arc::new(move |event: Event| {
            let this = this.clone();
            tokio::spawn(async move { this.ingest(event).await });
        });
        let _ = self.router.request_temporary_subscription(relays, vec![secondary], Some(on_secondary)).await;
    }

    async fn ingest(self: &Arc<Self>, event: Event) {
        let me = self.current_user.to_hex().to_lowercase();

        let (kind, target, emoji, zap_sats): (NotificationKind, Option<String>, Option<String>, Option<u64>) =
            match event.kind {
                Kind::Reaction => {
                    let target = last_e_tag(&event);
                    let emoji = match event.content.as_str() {
                        "+" => Some("❤️".to_string()),
                        "-" => None,
                        c => Some(c.to_string()),
                    };
                    (NotificationKind::Like, target, emoji, None)
                }
                Kind::TextNote => {
                    let is_reply = nip10::direct_parent(&event).is_some();
                    if is_reply {
                        (NotificationKind::Reply, nip10::direct_parent(&event).map(|id| id.to_hex()), None, None)
                    } else {
                        let mentions_me =
                            event.tags.iter().any(|t| t.as_slice().first().map(String::as_str) == Some("p"));
                        if mentions_me {
                            (NotificationKind::Mention, Some(event.id.to_hex()), None, None)
                        } else {
                            return;
                        }
                    }
                }
                Kind::Custom(1111) => {
                    let root = nip10::nip22_root(&event);
                    (NotificationKind::Reply, root.map(|id| id.to_hex()), None, None)
                }
                Kind::Repost => {
                    let target = last_e_tag(&event);
                    (NotificationKind::Repost, target, None, None)
                }
                Kind::ZapReceipt => {
                    let target = last_e_tag(&event);
                    let sats = zap_amount_sats(&event);
                    (NotificationKind::Zap, target, None, Some(sats))
                }
                _ => return,
            };

        let Some(target) = target else { return };

        // kind-1111 thread replies are re-classified as thread replies
        // only when the topic root belongs to the current user.
        if event.kind == Kind::Custom(1111) {
            let inner = self.inner.lock().await;
            let targets_own_topic = inner.my_topic_ids.contains(&target);
            drop(inner);
            if !targets_own_topic {
                return;
            }
        }

        // LIKE/REPLY targets a note; drop unless that note is authored
        // by the current user. Resolved on demand and cached.
        if matches!(kind, NotificationKind::Like | NotificationKind::Reply) && event.kind != Kind::Custom(1111) {
            match self.resolve_target_author(&target).await {
                Some(author) if author.eq_ignore_ascii_case(&me) => {}
                Some(_) => return,
                None => return,
            }
        }

        let actor = event.pubkey.to_hex().to_lowercase();
        let mut inner = self.inner.lock().await;
        let key = (kind, target.clone());
        let entry = inner.by_target.entry(key).or_insert_with(|| Notification {
            kind,
            actors: Vec::new(),
            target_note_id: target.clone(),
            sort_timestamp_ms: 0,
            reaction_emoji: None,
            zap_amount_sats: None,
        });
        if !entry.actors.contains(&actor) {
            entry.actors.push(actor);
        }
        entry.sort_timestamp_ms = entry.sort_timestamp_ms.max(event.created_at.as_u64() * 1000);
        if emoji.is_some() {
            entry.reaction_emoji = emoji;
        }
        if let Some(sats) = zap_sats {
            entry.zap_amount_sats = Some(entry.zap_amount_sats.unwrap_or(0) + sats);
        }
        drop(inner);

        let _ = self.updates.send(());
    }

    /// Resolves and caches the author of a target note via a short-lived
    /// one-off fetch, mirroring the Thread Builder's missing-id pattern.
    async fn resolve_target_author(self: &Arc<Self>, target: &str) -> Option<String> {
        {
            let inner = self.inner.lock().await;
            if let Some(cached) = inner.target_author.get(target) {
                return cached.clone();
            }
        }

        let Ok(id) = EventId::from_hex(target) else { return None };
        let relays = self.relays.lock().await.clone();
        let filter = filters::event_by_id_filter(id);
        let (found_tx, found_rx) = oneshot::channel::<String>();
        let found_tx = Arc::new(Mutex::new(Some(found_tx)));
        let on_event: crate::router::OnEvent = Arc::new(move |event: Event| {
            let found_tx = found_tx.clone();
            let author = event.pubkey.to_hex();
            tokio::spawn(async move {
                if let Some(tx) = found_tx.lock().await.take() {
                    let _ = tx.send(author);
                }
            });
        });

        let resolved = if let Ok(handle) =
            self.router.request_temporary_subscription(relays, vec![filter], Some(on_event)).await
        {
            let resolved = tokio::select! {
                found = found_rx => found.ok(),
                _ = tokio::time::sleep(self.config.topic_id_timeout) => None,
            };
            handle.cancel().await;
            resolved
        } else {
            None
        };

        self.inner.lock().await.target_author.insert(target.to_string(), resolved.clone());
        resolved
    }

    pub async fn list(&self) -> Vec<Notification> {
        let inner = self.inner.lock().await;
        let mut notifications: Vec<Notification> = inner.by_target.values().cloned().collect();
        notifications.sort_by(|a, b| b.sort_timestamp_ms.cmp(&a.sort_timestamp_ms));
        notifications
    }

    pub async fn unseen_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.by_target.values().filter(|n| !inner.seen.contains(&n.target_note_id)).count()
    }

    pub async fn mark_all_as_seen(&self) {
        let mut inner = self.inner.lock().await;
        let ids: Vec<String> = inner.by_target.values().map(|n| n.target_note_id.clone()).collect();
        inner.seen.extend(ids);
        drop(inner);
        self.persist_seen().await;
    }

    pub async fn mark_as_seen(&self, target_note_id: &str) {
        self.inner.lock().await.seen.insert(target_note_id.to_string());
        self.persist_seen().await;
    }

    pub async fn mark_as_seen_by_type(&self, kind: NotificationKind) {
        let mut inner = self.inner.lock().await;
        let ids: Vec<String> =
            inner.by_target.values().filter(|n| n.kind == kind).map(|n| n.target_note_id.clone()).collect();
        inner.seen.extend(ids);
        drop(inner);
        self.persist_seen().await;
    }

    /// Trim the seen-set to the intersection with currently-known target
    /// ids, preventing unbounded growth as old notifications roll off.
    pub async fn trim_seen(&self) {
        let mut inner = self.inner.lock().await;
        let known: HashSet<String> = inner.by_target.values().map(|n| n.target_note_id.clone()).collect();
        inner.seen.retain(|id| known.contains(id));
        drop(inner);
        self.persist_seen().await;
    }

    async fn persist_seen(&self) {
        let inner = self.inner.lock().await;
        let ids: Vec<&String> = inner.seen.iter().collect();
        if let Ok(json) = serde_json::to_vec(&ids) {
            drop(inner);
            let _ = self.storage.put("notifications:seen", json).await;
        }
    }
}

fn last_e_tag(event: &Event) -> Option<String> {
    event
        .tags
        .iter()
        .filter(|t| t.as_slice().first().map(String::as_str) == Some("e"))
        .filter_map(|t| t.as_slice().get(1).cloned())
        .last()
}

fn zap_amount_sats(event: &Event) -> u64 {
    let bolt11 = event
        .tags
        .iter()
        .find(|t| t.as_slice().first().map(String::as_str) == Some("bolt11"))
        .and_then(|t| t.as_slice().get(1).cloned());
    bolt11.as_deref().and_then(crate::bolt11::decode_amount_sats).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consolidates_by_target_and_kind() {
        let mut by_target: HashMap<(NotificationKind, String), Notification> = HashMap::new();
        let key = (NotificationKind::Like, "abc".to_string());
        by_target.insert(
            key.clone(),
            Notification {
                kind: NotificationKind::Like,
                actors: vec!["a".into()],
                target_note_id: "abc".into(),
                sort_timestamp_ms: 1,
                reaction_emoji: Some("❤️".into()),
                zap_amount_sats: None,
            },
        );
        assert_eq!(by_target.len(), 1);
        assert!(by_target.contains_key(&key));
    }
}
