//! NIP-10 reply-marker parsing and NIP-22 thread-reply classification.
//!
//! Two call sites need slightly different answers from the same tag set:
//! the Counts Aggregator only needs the *direct parent* of a kind-1 reply
//! (for depth-1 reply counting), while the Thread Builder needs the full
//! `(root, reply)` pair to classify an event within a thread. Both are
//! exposed here so neither recomputes the other's tag scan.

use nostr::nips::nip10::Marker;
use nostr::{Alphabet, Event, EventId, Kind, SingleLetterTag, TagKind, TagStandard};

struct ETag {
    id: EventId,
    marker: Option<Marker>,
}

fn e_tags(event: &Event) -> Vec<ETag> {
    event
        .tags
        .iter()
        .filter(|t| t.kind() == TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::E)))
        .filter_map(|t| match t.as_standardized() {
            Some(TagStandard::Event { event_id, marker, .. }) => {
                Some(ETag { id: *event_id, marker: marker.clone() })
            }
            _ => {
                // Positional fallback for tags the standardizer didn't
                // recognize (e.g. missing/garbled relay-hint field):
                // [e, id, relay?, marker-or-pubkey?, marker?]. Spec's
                // lookup order for a marker is index 3 then 4 then 2.
                let content = t.content()?;
                let id = EventId::from_hex(content).ok()?;
                let rest: Vec<&str> = t.as_slice().iter().skip(1).map(String::as_str).collect();
                let marker = [3usize, 4, 2]
                    .into_iter()
                    .filter_map(|i| rest.get(i))
                    .find_map(|s| marker_from_str(s));
                Some(ETag { id, marker })
            }
        })
        .collect()
}

fn marker_from_str(s: &str) -> Option<Marker> {
    match s {
        "root" => Some(Marker::Root),
        "reply" => Some(Marker::Reply),
        _ => None,
    }
}

/// Direct parent of a kind-1 reply, per the Counts Aggregator's reply
/// accounting rule: marked "reply" > marked "root" > last e-tag id.
/// Returns `None` for a non-reply (no e-tags).
pub fn direct_parent(event: &Event) -> Option<EventId> {
    let tags = e_tags(event);
    if let Some(t) = tags.iter().find(|t| t.marker == Some(Marker::Reply)) {
        return Some(t.id);
    }
    if let Some(t) = tags.iter().find(|t| t.marker == Some(Marker::Root)) {
        return Some(t.id);
    }
    tags.last().map(|t| t.id)
}

/// `(root, reply)` classification for a kind-1 event, per C6's
/// `parseRoot`. `root` is `None` when no root can be identified — a
/// lone marked-"reply" e-tag names a parent but not a thread root.
/// 1. marked root / marked reply tags win outright;
/// 2. a lone marked-"reply" tag with no root marker: root is null;
/// 3. exactly one unmarked e-tag: both root and reply are that id;
/// 4. otherwise positional: first e-tag is root, last is reply;
/// 5. edge case: root is marked but no reply marker and ≥ 2 e-tags —
///    reply is the last e-tag whose id differs from root.
pub fn parse_root(event: &Event) -> Option<(Option<EventId>, EventId)> {
    let tags = e_tags(event);
    if tags.is_empty() {
        return None;
    }

    let marked_root = tags.iter().find(|t| t.marker == Some(Marker::Root)).map(|t| t.id);
    let marked_reply = tags.iter().find(|t| t.marker == Some(Marker::Reply)).map(|t| t.id);

    if let (Some(root), Some(reply)) = (marked_root, marked_reply) {
        return Some((Some(root), reply));
    }
    if let Some(root) = marked_root {
        if tags.len() >= 2 {
            if let Some(reply) = tags.iter().rev().map(|t| t.id).find(|id| *id != root) {
                return Some((Some(root), reply));
            }
        }
        return Some((Some(root), root));
    }
    if let Some(reply) = marked_reply {
        return Some((None, reply));
    }
    if tags.len() == 1 {
        return Some((Some(tags[0].id), tags[0].id));
    }
    let root = tags.first().map(|t| t.id)?;
    let reply = tags.last().map(|t| t.id)?;
    Some((Some(root), reply))
}

/// Root event id referenced by a NIP-22 kind-1111 thread reply (uppercase
/// `E` tag), used by C7 to join topic replies back to the topic root.
pub fn nip22_root(event: &Event) -> Option<EventId> {
    if event.kind != Kind::Custom(1111) {
        return None;
    }
    event.tags.iter().find_map(|t| match t.as_standardized() {
        Some(TagStandard::Event { event_id, .. })
            if t.kind() == TagKind::SingleLetter(SingleLetterTag::uppercase(Alphabet::E)) =>
        {
            Some(*event_id)
        }
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys, Tag};

    fn note_with_e_tags(ids: &[(EventId, Option<&str>)]) -> Event {
        let keys = Keys::generate();
        let tags: Vec<Tag> = ids
            .iter()
            .map(|(id, marker)| match marker {
                Some(m) => Tag::parse(["e", &id.to_hex(), "", m]).unwrap(),
                None => Tag::parse(["e", &id.to_hex()]).unwrap(),
            })
            .collect();
        EventBuilder::text_note("hi").tags(tags).sign_with_keys(&keys).unwrap()
    }

    #[test]
    fn single_e_tag_is_both_root_and_reply() {
        let id = EventId::all_zeros();
        let ev = note_with_e_tags(&[(id, None)]);
        assert_eq!(parse_root(&ev), Some((Some(id), id)));
        assert_eq!(direct_parent(&ev), Some(id));
    }

    #[test]
    fn positional_first_and_last() {
        let root = EventId::all_zeros();
        let reply = EventId::from_byte_array([1u8; 32]);
        let ev = note_with_e_tags(&[(root, None), (reply, None)]);
        assert_eq!(parse_root(&ev), Some((Some(root), reply)));
        assert_eq!(direct_parent(&ev), Some(reply));
    }

    #[test]
    fn marked_reply_wins_for_direct_parent() {
        let root = EventId::all_zeros();
        let reply = EventId::from_byte_array([1u8; 32]);
        let ev = note_with_e_tags(&[(root, Some("root")), (reply, Some("reply"))]);
        assert_eq!(direct_parent(&ev), Some(reply));
        assert_eq!(parse_root(&ev), Some((Some(root), reply)));
    }

    #[test]
    fn root_marked_without_reply_marker_picks_last_non_root() {
        let root = EventId::all_zeros();
        let mid = EventId::from_byte_array([2u8; 32]);
        let ev = note_with_e_tags(&[(root, Some("root")), (mid, None)]);
        assert_eq!(parse_root(&ev), Some((Some(root), mid)));
    }

    #[test]
    fn lone_marked_reply_has_no_resolved_root() {
        let reply = EventId::all_zeros();
        let ev = note_with_e_tags(&[(reply, Some("reply"))]);
        assert_eq!(parse_root(&ev), Some((None, reply)));
        assert_eq!(direct_parent(&ev), Some(reply));
    }
}
