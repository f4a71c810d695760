//! External collaborator boundaries.
//!
//! The core never talks to a signing key, a key-value store, or an HTTP
//! stack directly — it depends on these trait objects so it can be
//! exercised in tests without a wallet, a filesystem, or a network.

use std::time::Duration;

use async_trait::async_trait;
use nostr::{Event, PublicKey, UnsignedEvent};

use crate::error::Result;

/// Signs event templates built by the Publisher (C9). Implementations
/// typically wrap a NIP-07 browser extension, a local secret key, or a
/// remote signer protocol (NIP-46) — the core is agnostic to which.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, template: UnsignedEvent) -> Result<Event>;
    fn public_key(&self) -> PublicKey;
}

/// Minimal key-value persistence used for every cache's snapshot writer
/// (feed notes, profile cache, seen-notifications set, discovery
/// catalog, relay lists). One JSON document per key.
#[async_trait]
pub trait KvStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
}

/// HTTP collaborator for NIP-11 relay descriptors and the REST discovery
/// catalog (C8's primary source).
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str, timeout: Duration) -> Result<Vec<u8>>;
    async fn post_json(&self, url: &str, body: serde_json::Value, timeout: Duration) -> Result<Vec<u8>>;
}
