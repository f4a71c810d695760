//! Publisher (C9): event template construction for the supported kinds,
//! signing via the external [`Signer`], and fan-out publish to chosen
//! outbox relays. Follow/unfollow mutate the in-memory latest kind-3.

use std::sync::Arc;

use nostr::{Event, EventBuilder, Kind, PublicKey, Tag, UnsignedEvent};
use tokio::sync::Mutex;

use crate::error::{CoreError, Result};
use crate::pool::RelayPool;
use crate::traits::Signer;
use crate::wire;

pub struct Publisher {
    signer: Arc<dyn Signer>,
    pool: Arc<RelayPool>,
    contacts: Mutex<Option<Event>>,
}

impl Publisher {
    pub fn new(signer: Arc<dyn Signer>, pool: Arc<RelayPool>) -> Arc<Self> {
        Arc::new(Self { signer, pool, contacts: Mutex::new(None) })
    }

    /// Seeds the in-memory latest kind-3 so follow/unfollow has a base to
    /// mutate before the first publish of this session.
    pub async fn seed_contacts(&self, latest: Event) {
        *self.contacts.lock().await = Some(latest);
    }

    async fn publish(&self, template: EventBuilder, outbox_relays: &[String]) -> Result<Event> {
        let unsigned: UnsignedEvent = template.build(self.signer.public_key());
        let event = self.signer.sign(unsigned).await?;
        self.broadcast(&event, outbox_relays).await?;
        Ok(event)
    }

    async fn broadcast(&self, event: &Event, outbox_relays: &[String]) -> Result<()> {
        let frame = wire::encode_event(event);
        let mut last_err = None;
        let mut ok_count = 0;
        for relay in outbox_relays {
            match self.pool.send_frame(relay, frame.clone()).await {
                Ok(()) => ok_count += 1,
                Err(e) => {
                    tracing::warn!(relay, kind = ?event.kind, error = %e, "publish to relay failed");
                    last_err = Some(e);
                }
            }
        }
        tracing::debug!(id = %event.id, kind = ?event.kind, ok = ok_count, total = outbox_relays.len(), "publish fan-out complete");
        if ok_count > 0 {
            Ok(())
        } else {
            Err(last_err.unwrap_or_else(|| CoreError::Protocol("no outbox relays configured".into())))
        }
    }

    /// kind-1 text note, optionally as a NIP-10 reply.
    pub async fn post_note(
        &self,
        content: &str,
        reply_to: Option<(nostr::EventId, nostr::EventId)>,
        outbox_relays: &[String],
    ) -> Result<Event> {
        let mut builder = EventBuilder::text_note(content);
        if let Some((root, parent)) = reply_to {
            let mut tags = vec![Tag::parse(["e", &root.to_hex(), "", "root"]).unwrap()];
            if parent != root {
                tags.push(Tag::parse(["e", &parent.to_hex(), "", "reply"]).unwrap());
            }
            builder = builder.tags(tags);
        }
        self.publish(builder, outbox_relays).await
    }

    /// kind-6 repost of `target`.
    pub async fn repost(&self, target: &Event, outbox_relays: &[String]) -> Result<Event> {
        let builder = EventBuilder::repost(target, None);
        self.publish(builder, outbox_relays).await
    }

    /// kind-7 reaction; `content` is `"+"`, `"-"`, or an emoji/shortcode.
    pub async fn react(&self, target: &Event, content: &str, outbox_relays: &[String]) -> Result<Event> {
        let builder = EventBuilder::reaction(target, content);
        self.publish(builder, outbox_relays).await
    }

    /// kind-11 topic (long-form-adjacent "topic" note per this system's
    /// threading model).
    pub async fn post_topic(&self, content: &str, title: Option<&str>, outbox_relays: &[String]) -> Result<Event> {
        let mut tags = Vec::new();
        if let Some(title) = title {
            tags.push(Tag::parse(["title", title]).unwrap());
        }
        let builder = EventBuilder::new(Kind::Custom(11), content).tags(tags);
        self.publish(builder, outbox_relays).await
    }

    /// kind-1111 NIP-22 thread reply, tagged to `root` with an uppercase
    /// `E` tag.
    pub async fn reply_to_topic(
        &self,
        content: &str,
        root: nostr::EventId,
        root_author: PublicKey,
        outbox_relays: &[String],
    ) -> Result<Event> {
        let tags = vec![
            Tag::parse(["E", &root.to_hex(), "", &root_author.to_hex()]).unwrap(),
            Tag::parse(["K", "11"]).unwrap(),
            Tag::parse(["P", &root_author.to_hex()]).unwrap(),
        ];
        let builder = EventBuilder::new(Kind::Custom(1111), content).tags(tags);
        self.publish(builder, outbox_relays).await
    }

    /// kind-30311 live activity announcement.
    pub async fn post_live_activity(
        &self,
        d_tag: &str,
        title: &str,
        status: &str,
        outbox_relays: &[String],
    ) -> Result<Event> {
        let tags = vec![
            Tag::parse(["d", d_tag]).unwrap(),
            Tag::parse(["title", title]).unwrap(),
            Tag::parse(["status", status]).unwrap(),
        ];
        let builder = EventBuilder::new(Kind::Custom(30311), "").tags(tags);
        self.publish(builder, outbox_relays).await
    }

    /// kind-10002 relay list (NIP-65).
    pub async fn publish_relay_list(
        &self,
        entries: &[(String, crate::types::RelayMarker)],
        outbox_relays: &[String],
    ) -> Result<Event> {
        let tags: Vec<Tag> = entries
            .iter()
            .map(|(url, marker)| match marker {
                crate::types::RelayMarker::Read => Tag::parse(["r", url, "read"]).unwrap(),
                crate::types::RelayMarker::Write => Tag::parse(["r", url, "write"]).unwrap(),
                crate::types::RelayMarker::Both => Tag::parse(["r", url]).unwrap(),
            })
            .collect();
        let builder = EventBuilder::new(Kind::RelayList, "").tags(tags);
        self.publish(builder, outbox_relays).await
    }

    /// kind-27235 HTTP auth event (NIP-98).
    pub async fn http_auth(&self, url: &str, method: &str, outbox_relays: &[String]) -> Result<Event> {
        let tags = vec![Tag::parse(["u", url]).unwrap(), Tag::parse(["method", method]).unwrap()];
        let builder = EventBuilder::new(Kind::Custom(27235), "").tags(tags);
        self.publish(builder, outbox_relays).await
    }

    /// Adds `pubkey` to the in-memory latest kind-3 and republishes. If
    /// no prior kind-3 is held, one is built from scratch with just this
    /// entry.
    pub async fn follow(&self, pubkey: PublicKey, outbox_relays: &[String]) -> Result<Event> {
        let mut tags = self.contact_tags().await;
        let hex = pubkey.to_hex();
        if !tags.iter().any(|t| t.as_slice().get(1).map(String::as_str) == Some(hex.as_str())) {
            tags.push(Tag::parse(["p", &hex]).unwrap());
        }
        self.publish_contacts(tags, outbox_relays).await
    }

    pub async fn unfollow(&self, pubkey: PublicKey, outbox_relays: &[String]) -> Result<Event> {
        let hex = pubkey.to_hex();
        let tags: Vec<Tag> = self
            .contact_tags()
            .await
            .into_iter()
            .filter(|t| t.as_slice().get(1).map(String::as_str) != Some(hex.as_str()))
            .collect();
        self.publish_contacts(tags, outbox_relays).await
    }

    async fn contact_tags(&self) -> Vec<Tag> {
        match self.contacts.lock().await.as_ref() {
            Some(event) => event.tags.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    async fn publish_contacts(&self, tags: Vec<Tag>, outbox_relays: &[String]) -> Result<Event> {
        let builder = EventBuilder::new(Kind::ContactList, "").tags(tags);
        let event = self.publish(builder, outbox_relays).await?;
        *self.contacts.lock().await = Some(event.clone());
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nostr::Keys;

    struct LocalSigner(Keys);

    #[async_trait]
    impl Signer for LocalSigner {
        async fn sign(&self, template: UnsignedEvent) -> Result<Event> {
            template.sign_with_keys(&self.0).map_err(|e| CoreError::Protocol(e.to_string()))
        }
        fn public_key(&self) -> PublicKey {
            self.0.public_key()
        }
    }

    #[test]
    fn follow_appends_p_tag_when_absent() {
        let tags: Vec<Tag> = Vec::new();
        let hex = "a".repeat(64);
        let mut tags = tags;
        if !tags.iter().any(|t| t.as_slice().get(1).map(String::as_str) == Some(hex.as_str())) {
            tags.push(Tag::parse(["p", &hex]).unwrap());
        }
        assert_eq!(tags.len(), 1);
    }
}
