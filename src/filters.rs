//! Filter factory functions shared across components.
//!
//! Each function returns one or more `nostr::Filter`s ready for
//! subscription or one-off query; callers own the relay-set choice.

use nostr::prelude::*;

/// Main feed: kind-1 notes and kind-6 reposts, optionally author-scoped.
pub fn timeline_filters(
    authors: Option<&[PublicKey]>,
    since: Option<Timestamp>,
    limit: usize,
) -> Vec<Filter> {
    let mut notes = Filter::new().kind(Kind::TextNote).limit(limit);
    let mut reposts = Filter::new().kind(Kind::Repost).limit(limit);

    if let Some(authors) = authors {
        notes = notes.authors(authors.iter().copied());
        reposts = reposts.authors(authors.iter().copied());
    }
    if let Some(since) = since {
        notes = notes.since(since);
        reposts = reposts.since(since);
    }
    vec![notes, reposts]
}

/// kind-0 metadata for one or more pubkeys (C4 batched fetch).
pub fn profile_filter(pubkeys: &[PublicKey]) -> Filter {
    Filter::new().kind(Kind::Metadata).authors(pubkeys.iter().copied())
}

/// kind-3 contact list (NIP-02).
pub fn follow_list_filter(pubkey: PublicKey) -> Filter {
    Filter::new().kind(Kind::ContactList).author(pubkey).limit(1)
}

/// kind-1 replies referencing the given event ids (C5 phase 1).
pub fn reply_filter(event_ids: &[EventId], limit: usize) -> Filter {
    Filter::new().kind(Kind::TextNote).events(event_ids.iter().copied()).limit(limit)
}

/// kind-7 reactions referencing the given event ids (C5 phase 2, NIP-25).
pub fn reaction_filter(event_ids: &[EventId], limit: usize) -> Filter {
    Filter::new().kind(Kind::Reaction).events(event_ids.iter().copied()).limit(limit)
}

/// kind-9735 zap receipts referencing the given event ids (C5 phase 2, NIP-57).
pub fn zap_filter(event_ids: &[EventId], limit: usize) -> Filter {
    Filter::new().kind(Kind::ZapReceipt).events(event_ids.iter().copied()).limit(limit)
}

/// Single event by id, used for C6 missing-parent resolution and
/// single-note fetches.
pub fn event_by_id_filter(id: EventId) -> Filter {
    Filter::new().kind(Kind::TextNote).id(id).limit(1)
}

/// kind-1 replies to a thread root (C6).
pub fn thread_replies_filter(root: EventId, limit: usize) -> Filter {
    Filter::new().kind(Kind::TextNote).event(root).limit(limit)
}

/// Notifications primary subscription: mentions/replies/reposts/reactions/
/// zaps/thread-replies addressed to `me` (C7).
pub fn notifications_filter(me: PublicKey, since: Timestamp, limit: usize) -> Filter {
    Filter::new()
        .kinds([
            Kind::TextNote,
            Kind::Repost,
            Kind::Reaction,
            Kind::ZapReceipt,
            Kind::Custom(1111),
        ])
        .pubkey(me)
        .since(since)
        .limit(limit)
}

/// Secondary notifications subscription: kind-1111 thread replies to one
/// of the user's own kind-11 topics (C7, NIP-22).
pub fn topic_replies_filter(topic_ids: &[EventId], limit: usize) -> Filter {
    Filter::new()
        .kind(Kind::Custom(1111))
        .custom_tags(SingleLetterTag::uppercase(Alphabet::E), topic_ids.iter().map(|id| id.to_hex()))
        .limit(limit)
}

/// kind-11 topics authored by `me`, used to discover topic ids for
/// [`topic_replies_filter`] (C7).
pub fn own_topics_filter(me: PublicKey, limit: usize) -> Filter {
    Filter::new().kind(Kind::Custom(11)).author(me).limit(limit)
}

/// kind-10002 relay list (NIP-65, C8).
pub fn relay_list_filter(pubkey: PublicKey) -> Filter {
    Filter::new().kind(Kind::RelayList).author(pubkey).limit(1)
}

/// kind-30166 relay monitor announcements (NIP-66, C8 fallback).
pub fn relay_monitor_filter(limit: usize) -> Filter {
    Filter::new().kind(Kind::Custom(30166)).limit(limit)
}

/// "since" timestamp N seconds before now.
pub fn since_duration_ago(secs: u64) -> Timestamp {
    Timestamp::now() - secs
}
