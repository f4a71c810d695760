//! Thread Builder (C6): per-root reply collection with missing-parent
//! resolution and ascending-timestamp emission.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nostr::{Event, EventId};
use tokio::sync::{broadcast, oneshot, Mutex};

use crate::config::ThreadConfig;
use crate::filters;
use crate::nip10;
use crate::router::SubscriptionRouter;

#[derive(Debug, Clone)]
pub struct ThreadReply {
    pub id: String,
    pub author: String,
    pub content: String,
    pub timestamp_ms: u64,
    pub parent_id: String,
    pub root_id: String,
}

/// A reply and its own replies, for callers that want a threaded view
/// instead of the flat, timestamp-sorted list from `replies_for`.
#[derive(Debug, Clone)]
pub struct ThreadNode {
    pub reply: ThreadReply,
    pub children: Vec<ThreadNode>,
}

struct RootState {
    replies: HashMap<String, ThreadReply>,
    pending_parents: HashSet<String>,
    relays: Vec<String>,
}

/// Replies keyed by root id, shared across every open thread view so a
/// reply observed while viewing one thread is available to another
/// without a second fetch.
pub struct ThreadReplyCache {
    router: Arc<SubscriptionRouter>,
    config: ThreadConfig,
    roots: Mutex<HashMap<String, RootState>>,
    updates: broadcast::Sender<String>,
}

impl ThreadReplyCache {
    pub fn new(config: ThreadConfig, router: Arc<SubscriptionRouter>) -> Arc<Self> {
        let (updates, _) = broadcast::channel(1024);
        Arc::new(Self { router, config, roots: Mutex::new(HashMap::new()), updates })
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<String> {
        self.updates.subscribe()
    }

    /// Open the root subscription against `relays` and begin collecting
    /// replies. Returns immediately; listen via `subscribe_updates`.
    pub async fn open_thread(self: &Arc<Self>, root: EventId, relays: Vec<String>) {
        {
            let mut roots = self.roots.lock().await;
            let state = roots.entry(root.to_hex()).or_insert_with(|| RootState {
                replies: HashMap::new(),
                pending_parents: HashSet::new(),
                relays: Vec::new(),
            });
            state.relays = relays.clone();
        }

        tracing::debug!(root = %root.to_hex(), relays = relays.len(), "opening thread");
        let filter = filters::thread_replies_filter(root, 100);
        let this = self.clone();
        let root_hex = root.to_hex();
        let on_event: crate::router::OnEvent = Arc::new(move |event: Event| {
            let this = this.clone();
            let root_hex = root_hex.clone();
            tokio::spawn(async move {
                this.ingest(&root_hex, event).await;
            });
        });
        let _ = self.router.request_temporary_subscription(relays, vec![filter], Some(on_event)).await;
    }

    pub async fn replies_for(&self, root: &EventId) -> Vec<ThreadReply> {
        let roots = self.roots.lock().await;
        let Some(state) = roots.get(&root.to_hex()) else { return Vec::new() };
        let mut replies: Vec<ThreadReply> = state.replies.values().cloned().collect();
        replies.sort_by_key(|r| r.timestamp_ms);
        replies
    }

    /// Materialize the flat reply list for `root` into a parent→children
    /// tree, each level sorted ascending by timestamp.
    pub async fn build_tree(&self, root: &EventId) -> Vec<ThreadNode> {
        let root_hex = root.to_hex();
        let replies = self.replies_for(root).await;
        attach_children(&root_hex, &replies)
    }

    fn ingest<'a>(
        self: &'a Arc<Self>,
        root_hex: &'a str,
        event: Event,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let Some((parsed_root, parent)) = nip10::parse_root(&event) else { return };
            let Some(parsed_root) = parsed_root else { return };
            if parsed_root.to_hex() != root_hex {
                return;
            }

            let reply = ThreadReply {
                id: event.id.to_hex(),
                author: event.pubkey.to_hex().to_lowercase(),
                content: event.content.clone(),
                timestamp_ms: event.created_at.as_u64() * 1000,
                parent_id: parent.to_hex(),
                root_id: root_hex.to_string(),
            };

            let (missing, relays): (Vec<String>, Vec<String>) = {
                let mut roots = self.roots.lock().await;
                let state = roots.entry(root_hex.to_string()).or_insert_with(|| RootState {
                    replies: HashMap::new(),
                    pending_parents: HashSet::new(),
                    relays: Vec::new(),
                });
                state.replies.insert(reply.id.clone(), reply.clone());

                let parent_hex = reply.parent_id.clone();
                let mut missing = Vec::new();
                if parent_hex != root_hex && !state.replies.contains_key(&parent_hex) && !state.pending_parents.contains(&parent_hex) {
                    state.pending_parents.insert(parent_hex.clone());
                    missing.push(parent_hex);
                }
                (missing, state.relays.clone())
            };

            let _ = self.updates.send(root_hex.to_string());

            for parent_id in missing {
                self.clone().resolve_missing_parent(root_hex.to_string(), parent_id, relays.clone()).await;
            }
        })
    }

    /// One-off 12 s-timeout fetch for a reply's parent that hasn't been
    /// observed yet. If the fetched event belongs to the same root, it
    /// is inserted and may itself reference a further missing parent.
    async fn resolve_missing_parent(self: Arc<Self>, root_hex: String, missing_id: String, relays: Vec<String>) {
        tracing::debug!(root = %root_hex, missing = %missing_id, "resolving missing parent");
        let Ok(id) = EventId::from_hex(&missing_id) else { return };
        let filter = filters::event_by_id_filter(id);
        let (found_tx, found_rx) = oneshot::channel::<Event>();
        let found_tx = Arc::new(Mutex::new(Some(found_tx)));

        let this = self.clone();
        let root_for_cb = root_hex.clone();
        let on_event: crate::router::OnEvent = Arc::new(move |event: Event| {
            let this = this.clone();
            let root_for_cb = root_for_cb.clone();
            let found_tx = found_tx.clone();
            tokio::spawn(async move {
                if let Some(tx) = found_tx.lock().await.take() {
                    let _ = tx.send(event.clone());
                }
                this.ingest(&root_for_cb, event).await;
            });
        });

        if let Ok(handle) = self.router.request_temporary_subscription(relays, vec![filter], Some(on_event)).await {
            tokio::select! {
                _ = found_rx => tracing::debug!(missing = %missing_id, "missing parent resolved"),
                _ = tokio::time::sleep(self.config.parent_fetch_timeout) => {
                    tracing::debug!(missing = %missing_id, "missing parent fetch timed out")
                }
            }
            handle.cancel().await;
        }

        let mut roots = self.roots.lock().await;
        if let Some(state) = roots.get_mut(&root_hex) {
            state.pending_parents.remove(&missing_id);
        }
    }
}

/// Recursive child attach, grounded in the same top-down recursion the
/// pack's own thread-tree builder uses, but over our already-parsed
/// `ThreadReply::parent_id` rather than re-reading NIP-10 tags.
fn attach_children(parent_id: &str, all_replies: &[ThreadReply]) -> Vec<ThreadNode> {
    let mut children: Vec<ThreadNode> = all_replies
        .iter()
        .filter(|r| r.parent_id == parent_id && r.id != parent_id)
        .map(|r| ThreadNode { reply: r.clone(), children: attach_children(&r.id, all_replies) })
        .collect();
    children.sort_by_key(|n| n.reply.timestamp_ms);
    children
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_reply_sorts_by_timestamp() {
        let mut replies = vec![
            ThreadReply {
                id: "b".into(),
                author: "auth".into(),
                content: "second".into(),
                timestamp_ms: 200,
                parent_id: "root".into(),
                root_id: "root".into(),
            },
            ThreadReply {
                id: "a".into(),
                author: "auth".into(),
                content: "first".into(),
                timestamp_ms: 100,
                parent_id: "root".into(),
                root_id: "root".into(),
            },
        ];
        replies.sort_by_key(|r| r.timestamp_ms);
        assert_eq!(replies[0].id, "a");
    }

    fn reply(id: &str, parent: &str, ts: u64) -> ThreadReply {
        ThreadReply {
            id: id.into(),
            author: "auth".into(),
            content: id.into(),
            timestamp_ms: ts,
            parent_id: parent.into(),
            root_id: "root".into(),
        }
    }

    #[test]
    fn attach_children_builds_nested_tree_sorted_by_timestamp() {
        let replies = vec![
            reply("c", "a", 300),
            reply("a", "root", 100),
            reply("b", "root", 200),
            reply("d", "a", 250),
        ];
        let tree = attach_children("root", &replies);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].reply.id, "a");
        assert_eq!(tree[1].reply.id, "b");
        assert_eq!(tree[0].children.len(), 2);
        assert_eq!(tree[0].children[0].reply.id, "d");
        assert_eq!(tree[0].children[1].reply.id, "c");
    }
}
