//! Discovery Catalog (C8): relay directory sourced from an HTTPS REST
//! catalog primarily, a NIP-66 relay-monitor subscription as fallback,
//! plus NIP-65 per-user relay-list lookup.

use std::collections::HashMap;
use std::sync::Arc;

use nostr::{Event, PublicKey};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::config::DiscoveryConfig;
use crate::filters;
use crate::router::SubscriptionRouter;
use crate::traits::{HttpClient, KvStorage};
use crate::types::{DiscoveredRelay, RelayListEntry, RelayMarker};

const CATALOG_URL: &str = "https://relay.tools/relays/search";

struct Inner {
    relays: HashMap<String, DiscoveredRelay>,
    fetched_at: Option<Instant>,
}

pub struct DiscoveryCatalog {
    config: DiscoveryConfig,
    router: Arc<SubscriptionRouter>,
    http: Arc<dyn HttpClient>,
    storage: Arc<dyn KvStorage>,
    inner: RwLock<Inner>,
}

impl DiscoveryCatalog {
    pub fn new(
        config: DiscoveryConfig,
        router: Arc<SubscriptionRouter>,
        http: Arc<dyn HttpClient>,
        storage: Arc<dyn KvStorage>,
    ) -> Arc<Self> {
        Arc::new(Self { config, router, http, storage, inner: RwLock::new(Inner { relays: HashMap::new(), fetched_at: None }) })
    }

    pub async fn restore(&self) {
        if let Ok(Some(bytes)) = self.storage.get("discovery:relays").await {
            if let Ok(relays) = serde_json::from_slice::<Vec<DiscoveredRelay>>(&bytes) {
                let mut inner = self.inner.write().await;
                for relay in relays {
                    inner.relays.insert(relay.url.clone(), relay);
                }
            }
        }
    }

    pub async fn relays(&self) -> Vec<DiscoveredRelay> {
        self.inner.read().await.relays.values().cloned().collect()
    }

    /// Resume hook: re-fetches only if the cache has exceeded its TTL or
    /// was never populated.
    pub async fn refresh_if_stale(self: &Arc<Self>, monitor_relays: Vec<String>) {
        let stale = {
            let inner = self.inner.read().await;
            inner.fetched_at.map(|t| t.elapsed() >= self.config.ttl).unwrap_or(true)
        };
        if stale {
            self.refresh(monitor_relays).await;
        }
    }

    pub async fn refresh(self: &Arc<Self>, monitor_relays: Vec<String>) {
        match self.fetch_from_catalog(None).await {
            Ok(()) => tracing::debug!("discovery refreshed from catalog"),
            Err(err) => {
                tracing::warn!(%err, "catalog fetch failed, falling back to relay monitors");
                self.fetch_from_monitors(monitor_relays).await;
            }
        }
        self.inner.write().await.fetched_at = Some(Instant::now());
        self.persist().await;
    }

    async fn fetch_from_catalog(&self, nips: Option<&[u32]>) -> crate::error::Result<()> {
        let mut body = serde_json::json!({ "limit": 500, "format": "detailed" });
        if let Some(nips) = nips {
            body["filter"] = serde_json::json!({ "nips": nips });
        }
        let bytes = self.http.post_json(CATALOG_URL, body, self.config.relay_list_timeout).await?;
        let parsed: Vec<CatalogRelay> = serde_json::from_slice(&bytes).map_err(crate::error::CoreError::Json)?;

        let mut inner = self.inner.write().await;
        for entry in parsed {
            let advertised_types = infer_relay_types(&entry.nips);
            inner.relays.insert(
                entry.url.clone(),
                DiscoveredRelay {
                    url: entry.url,
                    supported_nips: entry.nips,
                    advertised_types,
                    rtt_open_ms: entry.rtt_open_ms,
                    rtt_read_ms: entry.rtt_read_ms,
                    rtt_write_ms: entry.rtt_write_ms,
                    geo_label: entry.geo_label,
                    isp_label: entry.isp_label,
                    descriptor_name: entry.name,
                    descriptor_description: entry.description,
                    descriptor_contact: entry.contact,
                    observation_count: 1,
                    last_seen_ms: 0,
                },
            );
        }
        Ok(())
    }

    /// NIP-66 fallback: a 12 s temporary subscription against well-known
    /// monitor relays, aggregating kind-30166 announcements per relay URL.
    async fn fetch_from_monitors(self: &Arc<Self>, monitor_relays: Vec<String>) {
        let filter = filters::relay_monitor_filter(self.config.monitor_limit);
        let collected: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let collected_cb = collected.clone();
        let on_event: crate::router::OnEvent = Arc::new(move |event: Event| {
            let collected_cb = collected_cb.clone();
            tokio::spawn(async move {
                collected_cb.lock().await.push(event);
            });
        });

        if let Ok(handle) =
            self.router.request_temporary_subscription(monitor_relays, vec![filter], Some(on_event)).await
        {
            tokio::time::sleep(self.config.monitor_timeout).await;
            handle.cancel().await;
        }

        let events = collected.lock().await.clone();
        let aggregated = aggregate_monitor_announcements(&events);
        tracing::debug!(relays = aggregated.len(), "aggregated monitor announcements");

        let mut inner = self.inner.write().await;
        for (url, relay) in aggregated {
            inner.relays.insert(url, relay);
        }
    }

    /// NIP-65: latest kind-10002 by `pubkey`, parsed into read/write
    /// markers. 5 s timeout against indexer relays.
    pub async fn fetch_user_relay_list(
        &self,
        pubkey: PublicKey,
        indexer_relays: Vec<String>,
    ) -> Vec<RelayListEntry> {
        let filter = filters::relay_list_filter(pubkey);
        let latest: Arc<Mutex<Option<Event>>> = Arc::new(Mutex::new(None));
        let latest_cb = latest.clone();
        let on_event: crate::router::OnEvent = Arc::new(move |event: Event| {
            let latest_cb = latest_cb.clone();
            tokio::spawn(async move {
                let mut slot = latest_cb.lock().await;
                let replace = slot.as_ref().map(|e| event.created_at > e.created_at).unwrap_or(true);
                if replace {
                    *slot = Some(event);
                }
            });
        });

        if let Ok(handle) =
            self.router.request_temporary_subscription(indexer_relays, vec![filter], Some(on_event)).await
        {
            tokio::time::sleep(self.config.relay_list_timeout).await;
            handle.cancel().await;
        }

        let Some(event) = latest.lock().await.clone() else { return Vec::new() };
        parse_relay_list(&event)
    }

    async fn persist(&self) {
        let inner = self.inner.read().await;
        let relays: Vec<&DiscoveredRelay> = inner.relays.values().collect();
        if let Ok(json) = serde_json::to_vec(&relays) {
            drop(inner);
            let _ = self.storage.put("discovery:relays", json).await;
        }
    }
}

#[derive(Debug, Deserialize)]
struct CatalogRelay {
    url: String,
    #[serde(default)]
    nips: Vec<u32>,
    #[serde(default)]
    rtt_open_ms: Option<u32>,
    #[serde(default)]
    rtt_read_ms: Option<u32>,
    #[serde(default)]
    rtt_write_ms: Option<u32>,
    #[serde(default)]
    geo_label: Option<String>,
    #[serde(default)]
    isp_label: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    contact: Option<String>,
}

fn infer_relay_types(nips: &[u32]) -> Vec<String> {
    let mut types = Vec::new();
    if nips.contains(&50) {
        types.push("SEARCH".to_string());
    }
    if nips.contains(&65) && (nips.contains(&1) || nips.contains(&2)) {
        types.push("PUBLIC_OUTBOX".to_string());
    }
    if nips.contains(&4) || nips.contains(&44) {
        types.push("PUBLIC_INBOX".to_string());
    }
    if nips.contains(&96) {
        types.push("BLOB".to_string());
    }
    if types.is_empty() && (nips.contains(&1) || nips.contains(&2)) {
        types.push("PUBLIC_OUTBOX".to_string());
    }
    types
}

fn aggregate_monitor_announcements(events: &[Event]) -> HashMap<String, DiscoveredRelay> {
    let mut byurl: HashMap<String, DiscoveredRelay> = HashMap::new();
    let mut monitors: HashMap<String, std::collections::HashSet<String>> = HashMap::new();
    let mut last_seen: HashMap<String, u64> = HashMap::new();

    for event in events {
        let tag_value = |name: &str| -> Option<String> {
            event.tags.iter().find(|t| t.as_slice().first().map(String::as_str) == Some(name))
                .and_then(|t| t.as_slice().get(1).cloned())
        };
        let Some(url) = tag_value("d") else { continue };

        let relay = byurl.entry(url.clone()).or_insert_with(|| DiscoveredRelay { url: url.clone(), ..Default::default() });

        for t in event.tags.iter().filter(|t| t.as_slice().first().map(String::as_str) == Some("T")) {
            if let Some(v) = t.as_slice().get(1) {
                if !relay.advertised_types.contains(v) {
                    relay.advertised_types.push(v.clone());
                }
            }
        }
        for t in event.tags.iter().filter(|t| t.as_slice().first().map(String::as_str) == Some("N")) {
            if let Some(v) = t.as_slice().get(1).and_then(|s| s.parse::<u32>().ok()) {
                if !relay.supported_nips.contains(&v) {
                    relay.supported_nips.push(v);
                }
            }
        }
        for prefix in ["rtt-open", "rtt-read", "rtt-write"] {
            if let Some(v) = tag_value(prefix).and_then(|s| s.parse::<u32>().ok()) {
                let slot = match prefix {
                    "rtt-open" => &mut relay.rtt_open_ms,
                    "rtt-read" => &mut relay.rtt_read_ms,
                    _ => &mut relay.rtt_write_ms,
                };
                *slot = Some(match slot {
                    Some(existing) => (*existing + v) / 2,
                    None => v,
                });
            }
        }
        if let Some(country) = tag_value("l") {
            relay.geo_label.get_or_insert(country);
        }

        if let Ok(nip11) = serde_json::from_str::<Value>(&event.content) {
            if relay.descriptor_name.is_none() {
                relay.descriptor_name = nip11.get("name").and_then(Value::as_str).map(str::to_string);
            }
            if relay.descriptor_description.is_none() {
                relay.descriptor_description = nip11.get("description").and_then(Value::as_str).map(str::to_string);
            }
            if relay.descriptor_contact.is_none() {
                relay.descriptor_contact = nip11.get("contact").and_then(Value::as_str).map(str::to_string);
            }
        }

        monitors.entry(url.clone()).or_default().insert(event.pubkey.to_hex());
        let seen = last_seen.entry(url.clone()).or_insert(0);
        *seen = (*seen).max(event.created_at.as_u64());
    }

    for (url, relay) in byurl.iter_mut() {
        relay.observation_count = monitors.get(url).map(|m| m.len() as u64).unwrap_or(1);
        relay.last_seen_ms = last_seen.get(url).copied().unwrap_or(0) * 1000;
    }

    byurl
}

fn parse_relay_list(event: &Event) -> Vec<RelayListEntry> {
    event
        .tags
        .iter()
        .filter(|t| t.as_slice().first().map(String::as_str) == Some("r"))
        .filter_map(|t| {
            let slice = t.as_slice();
            let url = slice.get(1)?.clone();
            let marker = match slice.get(2).map(String::as_str) {
                Some("read") => RelayMarker::Read,
                Some("write") => RelayMarker::Write,
                _ => RelayMarker::Both,
            };
            Some(RelayListEntry { url, marker })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_search_type_from_nip50() {
        assert_eq!(infer_relay_types(&[50]), vec!["SEARCH".to_string()]);
    }

    #[test]
    fn infers_public_outbox_from_nip65_and_1() {
        assert_eq!(infer_relay_types(&[65, 1]), vec!["PUBLIC_OUTBOX".to_string()]);
    }

    #[test]
    fn falls_back_to_public_outbox() {
        assert_eq!(infer_relay_types(&[1]), vec!["PUBLIC_OUTBOX".to_string()]);
    }

    #[test]
    fn infers_blob_from_nip96() {
        assert_eq!(infer_relay_types(&[96]), vec!["BLOB".to_string()]);
    }
}
