//! Feed Aggregator (C3): batched note ingestion, cutoff-based partition
//! into visible vs. pending, follow filtering, and the displayed
//! projection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use nostr::{Event, EventId, Filter, Kind, PublicKey};
use tokio::sync::{mpsc, oneshot, Mutex, Notify, RwLock};
use tokio::time::Instant;

use crate::config::FeedConfig;
use crate::nip10;
use crate::router::SubscriptionRouter;
use crate::sanitize;
use crate::traits::KvStorage;
use crate::types::{Note, RepostMeta};

const TAG_ONLY_REPOST_TIMEOUT: Duration = Duration::from_secs(10);
const TAG_ONLY_REPOST_MAX_RELAYS: usize = 5;

/// The two snapshot keys §4.3 "Memory cap" persists under, selected by
/// whichever feed mode was last active.
const SNAPSHOT_KEY_ALL: &str = "feed:all";
const SNAPSHOT_KEY_FOLLOWING: &str = "feed:following";
const SNAPSHOT_KEY_LAST_MODE: &str = "feed:last_mode";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Loading,
    Live,
    Refreshing,
}

struct Inner {
    all_notes: Vec<Note>,
    pending_new: HashMap<String, Note>,
    displayed: Vec<Note>,
    cutoff_ms: u64,
    first_displayed_at: Option<Instant>,
    session: SessionState,
    display_relays: HashSet<String>,
    follow_filter: Option<HashSet<String>>,
    new_count_all: usize,
    new_count_following: usize,
}

/// Reactive containers + partition/projection logic for the main feed.
pub struct FeedAggregator {
    config: FeedConfig,
    current_user: PublicKey,
    router: Arc<SubscriptionRouter>,
    inner: RwLock<Inner>,
    ingest_tx: mpsc::UnboundedSender<Event>,
    flush_notify: Arc<Notify>,
    storage: Arc<dyn KvStorage>,
    /// Cheap sync snapshot of the standing feed subscription's target,
    /// kept in step with `display_relays` so the pool's resume provider
    /// (a plain `Fn`, not async) can read it without a lock await.
    resume_snapshot: StdMutex<(Vec<String>, Option<Vec<PublicKey>>)>,
}

impl FeedAggregator {
    pub fn new(
        config: FeedConfig,
        current_user: PublicKey,
        router: Arc<SubscriptionRouter>,
        storage: Arc<dyn KvStorage>,
    ) -> Arc<Self> {
        let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();
        let flush_notify = Arc::new(Notify::new());

        let this = Arc::new(Self {
            config,
            current_user,
            router,
            inner: RwLock::new(Inner {
                all_notes: Vec::new(),
                pending_new: HashMap::new(),
                displayed: Vec::new(),
                cutoff_ms: now_ms(),
                first_displayed_at: None,
                session: SessionState::Idle,
                display_relays: HashSet::new(),
                follow_filter: None,
                new_count_all: 0,
                new_count_following: 0,
            }),
            ingest_tx,
            flush_notify,
            storage,
            resume_snapshot: StdMutex::new((Vec::new(), None)),
        });

        this.clone().spawn_ingest_loop(ingest_rx);
        this
    }

    /// Loads the snapshot matching the follow-filter mode last persisted
    /// (or "all" when none was ever recorded), marks the session `Live`,
    /// consumes the grace window, and sets the cutoff to now so anything
    /// arriving after this point is treated as new.
    pub async fn restore(&self) {
        let key = match self.storage.get(SNAPSHOT_KEY_LAST_MODE).await {
            Ok(Some(bytes)) if bytes == SNAPSHOT_KEY_FOLLOWING.as_bytes() => SNAPSHOT_KEY_FOLLOWING,
            _ => SNAPSHOT_KEY_ALL,
        };
        let snapshot = self.storage.get(key).await.ok().flatten();

        let mut inner = self.inner.write().await;
        if let Some(notes) = snapshot.and_then(|bytes| serde_json::from_slice::<Vec<Note>>(&bytes).ok()) {
            inner.all_notes = notes;
            self.project(&mut inner);
        }
        inner.session = SessionState::Live;
        inner.first_displayed_at = Some(Instant::now() - self.config.grace_window.unwrap_or(Duration::ZERO));
        inner.cutoff_ms = now_ms();
        tracing::debug!(key, restored = inner.all_notes.len(), "feed restored from snapshot");
    }

    /// Lock-free enqueue from the kind-1/6/11 global handler. A flush is
    /// scheduled on the first enqueue and debounced; each enqueue resets
    /// the timer.
    pub fn ingest(&self, event: Event) {
        let _ = self.ingest_tx.send(event);
        self.flush_notify.notify_one();
    }

    fn spawn_ingest_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Event>) {
        tokio::spawn(async move {
            let mut queue: VecDeque<Event> = VecDeque::new();
            loop {
                tokio::select! {
                    biased;
                    maybe_event = rx.recv() => {
                        match maybe_event {
                            Some(event) => queue.push_back(event),
                            None => break,
                        }
                        // Debounce: keep draining the channel without
                        // blocking, then wait out the debounce window
                        // from the last enqueue before flushing.
                        loop {
                            tokio::select! {
                                more = rx.recv() => match more {
                                    Some(event) => queue.push_back(event),
                                    None => break,
                                },
                                _ = tokio::time::sleep(self.config.flush_debounce) => break,
                            }
                        }
                        self.flush(queue.drain(..).collect()).await;
                    }
                }
            }
        });
    }

    async fn flush(self: &Arc<Self>, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let mut tag_only_reposts = Vec::new();
        {
            let mut inner = self.inner.write().await;
            for event in events {
                if event.kind == Kind::Repost {
                    match repost_note_from_content(&event) {
                        Some(note) => self.ingest_note(&mut inner, note),
                        None => tag_only_reposts.push(event),
                    }
                } else {
                    let note = event_to_note(&event);
                    self.ingest_note(&mut inner, note);
                }
            }
            self.trim_and_project(&mut inner);
            let all = inner.all_notes.len();
            let displayed = inner.displayed.len();
            tracing::debug!(all, displayed, "feed flush complete");
        }
        self.schedule_snapshot();
        for event in tag_only_reposts {
            tokio::spawn(self.clone().resolve_tag_only_repost(event));
        }
    }

    fn ingest_note(&self, inner: &mut Inner, note: Note) {
        // Reposts supersede a standalone note with the same original id
        // in either arrival order (§4.3 "repost supersedes").
        if let Some(repost) = &note.repost {
            inner.all_notes.retain(|n| n.id != repost.original_id);
            inner.pending_new.remove(&repost.original_id);
        } else {
            let composite_id = format!("repost:{}", note.id);
            if inner.all_notes.iter().any(|n| n.id == composite_id)
                || inner.pending_new.contains_key(&composite_id)
            {
                return;
            }
        }

        if let Some(existing) = inner.all_notes.iter_mut().find(|n| n.id == note.id) {
            existing.relay_urls.extend(note.relay_urls);
            if let (Some(existing_repost), Some(new_repost)) = (&mut existing.repost, &note.repost) {
                for author in &new_repost.reposter_authors {
                    if !existing_repost.reposter_authors.contains(author) {
                        existing_repost.reposter_authors.push(author.clone());
                    }
                }
                existing_repost.repost_timestamp_ms =
                    existing_repost.repost_timestamp_ms.max(new_repost.repost_timestamp_ms);
            }
            return;
        }

        if inner.pending_new.contains_key(&note.id) {
            return;
        }

        let is_self = note.author.eq_ignore_ascii_case(&self.current_user.to_hex());
        let within_grace = match self.config.grace_window {
            Some(window) => inner.first_displayed_at.map(|t| t.elapsed() < window).unwrap_or(false),
            None => false,
        };

        if is_self || within_grace || note.timestamp_ms <= inner.cutoff_ms {
            inner.all_notes.push(note.clone());
            if inner.first_displayed_at.is_none() {
                inner.first_displayed_at = Some(Instant::now());
            }
        } else if inner.session == SessionState::Live
            && note.timestamp_ms <= inner.all_notes.iter().map(|n| n.timestamp_ms).max().unwrap_or(0)
        {
            // Late-arriving old: history expansion, does not bump pending.
            let pos = inner.all_notes.partition_point(|n| n.timestamp_ms >= note.timestamp_ms);
            inner.all_notes.insert(pos, note);
        } else {
            let is_followed =
                inner.follow_filter.as_ref().map(|f| f.contains(&note.author)).unwrap_or(false);
            inner.pending_new.insert(note.id.clone(), note);
            inner.new_count_all += 1;
            if is_followed {
                inner.new_count_following += 1;
            }
        }
    }

    fn trim_and_project(&self, inner: &mut Inner) {
        inner.all_notes.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        inner.all_notes.truncate(self.config.max_notes);
        self.project(inner);
    }

    fn project(&self, inner: &mut Inner) {
        let display_relays = inner.display_relays.clone();
        let follow_filter = inner.follow_filter.clone();
        inner.displayed = inner
            .all_notes
            .iter()
            .filter(|n| !n.is_reply)
            .filter(|n| display_relays.is_empty() || !n.relay_urls.is_disjoint(&display_relays))
            .filter(|n| follow_filter.as_ref().map(|f| !f.is_empty() && f.contains(&n.author)).unwrap_or(true))
            .cloned()
            .collect();
    }

    /// Recompute the displayed projection; callers invoke this (through
    /// a debounce timer of their own) after changing relays or follows.
    pub async fn refresh_projection(&self) {
        let mut inner = self.inner.write().await;
        self.project(&mut inner);
    }

    pub async fn set_display_relays(&self, relays: HashSet<String>) {
        self.inner.write().await.display_relays = relays.clone();
        self.resume_snapshot.lock().unwrap().0 = relays.into_iter().collect();
        self.refresh_projection().await;
    }

    pub async fn set_follow_filter(&self, authors: Option<HashSet<String>>) {
        self.inner.write().await.follow_filter = authors.clone();
        let parsed: Option<Vec<PublicKey>> =
            authors.map(|set| set.iter().filter_map(|s| PublicKey::from_hex(s).ok()).collect());
        self.resume_snapshot.lock().unwrap().1 = parsed;
        self.refresh_projection().await;
    }

    /// Synchronous `(relays, filter)` snapshot for the pool's app-
    /// lifecycle resume provider, which cannot await a lock.
    pub fn resume_target(&self) -> (Vec<String>, Filter) {
        let (relays, authors) = self.resume_snapshot.lock().unwrap().clone();
        let filters = crate::filters::timeline_filters(authors.as_deref(), None, self.config.max_notes);
        (relays, filters.into_iter().next().unwrap_or_else(Filter::new))
    }

    pub async fn displayed_notes(&self) -> Vec<Note> {
        self.inner.read().await.displayed.clone()
    }

    pub async fn new_counts(&self) -> (usize, usize) {
        let inner = self.inner.read().await;
        (inner.new_count_all, inner.new_count_following)
    }

    /// Promotes pending into visible without clearing the list, and
    /// marks the session `Refreshing` for the duration of the promotion.
    pub async fn refresh(&self) {
        let mut inner = self.inner.write().await;
        inner.session = SessionState::Refreshing;
        let pending: Vec<Note> = inner.pending_new.drain().map(|(_, v)| v).collect();
        inner.all_notes.extend(pending);
        inner.new_count_all = 0;
        inner.new_count_following = 0;
        self.trim_and_project(&mut inner);
        inner.session = SessionState::Live;
    }

    fn schedule_snapshot(self: &Arc<Self>) {
        // Debounced persistence of the top-N snapshot; fire-and-forget
        // per the design's "never block the ingestion path" rule.
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.config.snapshot_debounce).await;
            let inner = this.inner.read().await;
            let notes = inner.all_notes.clone();
            let following_mode = inner.follow_filter.as_ref().map(|f| !f.is_empty()).unwrap_or(false);
            drop(inner);
            let top: Vec<&Note> = notes.iter().take(this.config.snapshot_size).collect();
            let key = if following_mode { SNAPSHOT_KEY_FOLLOWING } else { SNAPSHOT_KEY_ALL };
            if let Ok(json) = serde_json::to_vec(&top) {
                let _ = this.storage.put(key, json).await;
                let _ = this.storage.put(SNAPSHOT_KEY_LAST_MODE, key.as_bytes().to_vec()).await;
            }
        });
    }

    /// Tag-only repost (§4.3): blank content, original id only in an
    /// e-tag. Fetches the original against the e-tag's relay hint plus
    /// the current display relays (capped at 5), 10 s timeout.
    async fn resolve_tag_only_repost(self: Arc<Self>, repost_event: Event) {
        let Some(e_tag) = repost_event.tags.iter().find(|t| t.as_slice().first().map(String::as_str) == Some("e"))
        else {
            return;
        };
        let slice = e_tag.as_slice();
        let Some(original_id_hex) = slice.get(1) else { return };
        let Ok(original_id) = EventId::from_hex(original_id_hex) else { return };

        let mut relays: Vec<String> = Vec::new();
        if let Some(hint) = slice.get(2).filter(|s| !s.is_empty()) {
            relays.push(hint.clone());
        }
        relays.extend(self.inner.read().await.display_relays.iter().cloned());
        relays.truncate(TAG_ONLY_REPOST_MAX_RELAYS);
        if relays.is_empty() {
            return;
        }

        let filter = crate::filters::event_by_id_filter(original_id);
        let (found_tx, found_rx) = oneshot::channel::<Event>();
        let found_tx = Arc::new(Mutex::new(Some(found_tx)));
        let on_event: crate::router::OnEvent = Arc::new(move |event: Event| {
            let found_tx = found_tx.clone();
            tokio::spawn(async move {
                if let Some(tx) = found_tx.lock().await.take() {
                    let _ = tx.send(event);
                }
            });
        });

        let Ok(handle) = self.router.request_temporary_subscription(relays, vec![filter], Some(on_event)).await
        else {
            return;
        };
        let original = tokio::select! {
            found = found_rx => found.ok(),
            _ = tokio::time::sleep(TAG_ONLY_REPOST_TIMEOUT) => None,
        };
        handle.cancel().await;

        if let Some(original) = original {
            let note = build_repost_note(&original, &repost_event);
            let mut inner = self.inner.write().await;
            self.ingest_note(&mut inner, note);
            self.trim_and_project(&mut inner);
            drop(inner);
            self.schedule_snapshot();
        }
    }
}

fn event_to_note(event: &Event) -> Note {
    let content = sanitize::strip_control_chars(&event.content);
    let hashtags = sanitize::extract_hashtags(&content);
    let media_urls = sanitize::extract_media_urls(&content);
    let (root_id, parent_id) = nip10::parse_root(event)
        .map(|(root, parent)| (root.map(|r| r.to_hex()), Some(parent.to_hex())))
        .unwrap_or((None, None));

    Note {
        id: event.id.to_hex(),
        author: event.pubkey.to_hex().to_lowercase(),
        content,
        timestamp_ms: event.created_at.as_u64() * 1000,
        hashtags,
        media_urls,
        quoted_event_ids: Vec::new(),
        is_reply: parent_id.is_some(),
        root_id,
        parent_id,
        relay_urls: HashSet::new(),
        repost: None,
    }
}

/// Content-embedded repost (§4.3): `content` carries the full original
/// event as JSON. Author/timestamp come from the ORIGINAL event, not
/// the repost wrapper.
fn repost_note_from_content(event: &Event) -> Option<Note> {
    if event.content.trim().is_empty() {
        return None;
    }
    let original: Event = serde_json::from_str(&event.content).ok()?;
    Some(build_repost_note(&original, event))
}

fn build_repost_note(original: &Event, repost_event: &Event) -> Note {
    let content = sanitize::strip_control_chars(&original.content);
    let hashtags = sanitize::extract_hashtags(&content);
    let media_urls = sanitize::extract_media_urls(&content);
    let (root_id, parent_id) = nip10::parse_root(original)
        .map(|(root, parent)| (root.map(|r| r.to_hex()), Some(parent.to_hex())))
        .unwrap_or((None, None));
    let original_id = original.id.to_hex();

    Note {
        id: format!("repost:{original_id}"),
        author: original.pubkey.to_hex().to_lowercase(),
        content,
        timestamp_ms: original.created_at.as_u64() * 1000,
        hashtags,
        media_urls,
        quoted_event_ids: Vec::new(),
        is_reply: parent_id.is_some(),
        root_id,
        parent_id,
        relay_urls: HashSet::new(),
        repost: Some(RepostMeta {
            original_id,
            reposter_authors: vec![repost_event.pubkey.to_hex()],
            repost_timestamp_ms: repost_event.created_at.as_u64() * 1000,
        }),
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use nostr::{EventBuilder, Keys, Timestamp};

    struct NullStorage;

    #[async_trait::async_trait]
    impl KvStorage for NullStorage {
        async fn get(&self, _key: &str) -> std::result::Result<Option<Vec<u8>>, CoreError> {
            Ok(None)
        }
        async fn put(&self, _key: &str, _value: Vec<u8>) -> std::result::Result<(), CoreError> {
            Ok(())
        }
    }

    fn note_at(keys: &Keys, created_at: u64) -> Event {
        EventBuilder::text_note("hi").custom_created_at(Timestamp::from(created_at)).sign_with_keys(keys).unwrap()
    }

    fn test_feed(current_user: PublicKey) -> Arc<FeedAggregator> {
        let (inbound_tx, _inbound_rx) = mpsc::channel(16);
        let pool = crate::pool::RelayPool::new(Default::default(), inbound_tx);
        let router = SubscriptionRouter::new(pool);
        FeedAggregator::new(FeedConfig::default(), current_user, router, Arc::new(NullStorage))
    }

    #[tokio::test]
    async fn notes_at_or_before_cutoff_go_straight_to_visible() {
        let keys = Keys::generate();
        let feed = test_feed(keys.public_key());
        let cutoff = 10_000;
        {
            let mut inner = feed.inner.write().await;
            inner.cutoff_ms = cutoff;
        }
        let note = note_at(&keys, cutoff / 1000 - 1);
        feed.flush(vec![note]).await;
        assert_eq!(feed.displayed_notes().await.len(), 1);
        let (all, following) = feed.new_counts().await;
        assert_eq!((all, following), (0, 0));
    }

    #[tokio::test]
    async fn notes_past_cutoff_become_pending_until_refresh() {
        let keys = Keys::generate();
        let current_user = Keys::generate().public_key();
        let feed = test_feed(current_user);
        {
            let mut inner = feed.inner.write().await;
            inner.cutoff_ms = 1;
        }
        let note = note_at(&keys, 999_999_999);
        feed.flush(vec![note]).await;
        assert!(feed.displayed_notes().await.is_empty());
        let (all, _) = feed.new_counts().await;
        assert_eq!(all, 1);

        feed.refresh().await;
        assert_eq!(feed.displayed_notes().await.len(), 1);
        let (all_after, _) = feed.new_counts().await;
        assert_eq!(all_after, 0);
    }

    #[tokio::test]
    async fn own_notes_bypass_the_cutoff() {
        let keys = Keys::generate();
        let feed = test_feed(keys.public_key());
        {
            let mut inner = feed.inner.write().await;
            inner.cutoff_ms = 1;
        }
        let note = note_at(&keys, 999_999_999);
        feed.flush(vec![note]).await;
        assert_eq!(feed.displayed_notes().await.len(), 1);
    }

    #[tokio::test]
    async fn all_notes_list_is_capped_at_max_notes() {
        let keys = Keys::generate();
        let feed = test_feed(keys.public_key());
        let count = feed.config.max_notes + 20;
        let events: Vec<Event> = (0..count as u64).map(|i| note_at(&keys, 1 + i)).collect();
        let mut inner = feed.inner.write().await;
        inner.cutoff_ms = u64::MAX;
        for e in events {
            let note = event_to_note(&e);
            feed.ingest_note(&mut inner, note);
        }
        feed.trim_and_project(&mut inner);
        assert_eq!(inner.all_notes.len(), feed.config.max_notes);
    }

    #[tokio::test]
    async fn follow_filter_hides_non_followed_authors_from_projection() {
        let keys = Keys::generate();
        let stranger = Keys::generate();
        let feed = test_feed(keys.public_key());
        {
            let mut inner = feed.inner.write().await;
            inner.cutoff_ms = u64::MAX;
        }
        feed.set_follow_filter(Some([keys.public_key().to_hex().to_lowercase()].into_iter().collect())).await;
        feed.flush(vec![note_at(&keys, 5), note_at(&stranger, 5)]).await;
        let displayed = feed.displayed_notes().await;
        assert_eq!(displayed.len(), 1);
        assert_eq!(displayed[0].author, keys.public_key().to_hex().to_lowercase());
    }
}
