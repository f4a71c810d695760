use std::collections::{HashMap, HashSet};

use nostr::{EventId, PublicKey};
use serde::{Deserialize, Serialize};

/// Addressable-event key for replaceable/parameterized-replaceable kinds
/// (kind ≥ 10000 and 30000..40000). Only the latest `created_at` observed
/// for a given key is retained by any cache keyed on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressableKey {
    pub kind: u16,
    pub pubkey: PublicKey,
    pub d_tag: String,
}

/// Author metadata derived from the latest-observed kind-0 event for a
/// pubkey. Every string field has already passed through
/// [`crate::sanitize::sanitize_profile_field`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub about: Option<String>,
    pub nip05: Option<String>,
    pub website: Option<String>,
    pub lud16: Option<String>,
    pub banner: Option<String>,
    pub pronouns: Option<String>,
    /// `created_at` of the kind-0 event this record was derived from;
    /// governs monotonic-acceptance of later updates.
    pub last_event_created_at: u64,
}

impl Author {
    /// A placeholder returned synchronously by `resolve` before any kind-0
    /// event has been observed for `pubkey`.
    pub fn placeholder(pubkey: &str) -> Self {
        let short = pubkey.get(0..8).unwrap_or(pubkey);
        Self {
            id: pubkey.to_lowercase(),
            username: short.to_string(),
            display_name: short.to_string(),
            avatar_url: None,
            about: None,
            nip05: None,
            website: None,
            lud16: None,
            banner: None,
            pronouns: None,
            last_event_created_at: 0,
        }
    }

    /// One or two glyphs derived from `display_name`/`username`, for a
    /// deterministic fallback avatar when `avatar_url` is absent.
    pub fn initials(&self) -> String {
        let words: Vec<&str> = self.display_name.split_whitespace().collect();
        match words.as_slice() {
            [first, second, ..] => {
                let a = first.chars().next().unwrap_or('?');
                let b = second.chars().next().unwrap_or('?');
                format!("{a}{b}").to_uppercase()
            }
            [first] => first.chars().next().unwrap_or('?').to_uppercase().to_string(),
            [] => self.id.chars().next().unwrap_or('?').to_uppercase().to_string(),
        }
    }
}

/// Metadata recorded alongside a repost, when the Note is a repost
/// projection (composite id `repost:<origId>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepostMeta {
    pub original_id: String,
    pub reposter_authors: Vec<String>,
    pub repost_timestamp_ms: u64,
}

/// UI projection of a kind-1/kind-6/kind-11 event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    /// `event.id` hex, or `repost:<origId>` for a repost projection.
    pub id: String,
    pub author: String,
    pub content: String,
    /// Milliseconds since epoch.
    pub timestamp_ms: u64,
    pub hashtags: Vec<String>,
    pub media_urls: Vec<String>,
    pub quoted_event_ids: Vec<String>,
    pub is_reply: bool,
    pub root_id: Option<String>,
    pub parent_id: Option<String>,
    pub relay_urls: HashSet<String>,
    pub repost: Option<RepostMeta>,
}

/// Per-note aggregate engagement counts (C5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoteCounts {
    pub reply_count: u64,
    /// emoji -> authors who reacted with it
    pub reactions: HashMap<String, Vec<String>>,
    /// `:shortcode:` -> custom emoji image URL, from `emoji` tags
    pub custom_emoji_urls: HashMap<String, String>,
    pub zap_sats_total: u64,
    pub zap_sats_by_author: HashMap<String, u64>,
    /// Insertion order of zap authors, first-seen first.
    pub zap_authors: Vec<String>,
}

/// A relay discovered through NIP-66 or an indexer, with observed
/// connection characteristics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveredRelay {
    pub url: String,
    pub supported_nips: Vec<u32>,
    pub advertised_types: Vec<String>,
    pub rtt_open_ms: Option<u32>,
    pub rtt_read_ms: Option<u32>,
    pub rtt_write_ms: Option<u32>,
    pub geo_label: Option<String>,
    pub isp_label: Option<String>,
    pub descriptor_name: Option<String>,
    pub descriptor_description: Option<String>,
    pub descriptor_contact: Option<String>,
    pub observation_count: u64,
    /// Latest `created_at` among the monitor announcements aggregated
    /// into this record.
    pub last_seen_ms: u64,
}

/// Notification kind, per spec §3/§4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    Like,
    Reply,
    Mention,
    Repost,
    Zap,
}

/// A consolidated, display-ready notification: one or more actors acting
/// on the same target note, collapsed under a single sort timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub actors: Vec<String>,
    pub target_note_id: String,
    pub sort_timestamp_ms: u64,
    pub reaction_emoji: Option<String>,
    pub zap_amount_sats: Option<u64>,
}

/// NIP-65 relay-list entry: a URL plus its read/write marker (absent
/// marker means both).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayMarker {
    Read,
    Write,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayListEntry {
    pub url: String,
    pub marker: RelayMarker,
}

/// Per-relay connectivity snapshot exposed by the pool for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayInfo {
    pub url: String,
    pub state: String,
    pub active_subscriptions: usize,
}

/// Aggregate pool connectivity stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub connected_relays: usize,
    pub total_relays: usize,
    pub pending_subscriptions: usize,
}

pub(crate) fn event_id_hex(id: &EventId) -> String {
    id.to_hex()
}

pub(crate) fn pubkey_hex(pk: &PublicKey) -> String {
    pk.to_hex().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initials_from_two_word_display_name() {
        let mut author = Author::placeholder("abcdef0123456789");
        author.display_name = "Alice Bob".to_string();
        assert_eq!(author.initials(), "AB");
    }

    #[test]
    fn initials_from_single_word_display_name() {
        let mut author = Author::placeholder("abcdef0123456789");
        author.display_name = "alice".to_string();
        assert_eq!(author.initials(), "A");
    }

    #[test]
    fn initials_fall_back_to_pubkey_when_display_name_empty() {
        let mut author = Author::placeholder("abcdef0123456789");
        author.display_name = String::new();
        assert_eq!(author.initials(), "A");
    }
}
