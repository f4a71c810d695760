//! Relay Pool (C1): one logical connection per normalized relay URL.
//!
//! Connections are hand-rolled over `tokio-tungstenite` rather than
//! delegated to a higher-level relay client, because the state machine,
//! demand-driven backoff, idle-timeout and app-lifecycle resume hook
//! below are exactly what a high-level client would hide. The
//! reader/writer task split is grounded in a raw-WebSocket relay client
//! elsewhere in the pack; this version adds the state machine, backoff,
//! and idle accounting the spec requires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use nostr::Filter;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use crate::config::PoolConfig;
use crate::error::{CoreError, Result};
use crate::wire::{self, RelayMessage};

/// Per-connection lifecycle, per spec §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Normalize a relay URL: case-fold scheme and host, trim trailing
/// slash, default a missing scheme to `wss`, and rewrite `http`/`https`
/// to their WebSocket equivalents so a bare host or an `https://` URL
/// both resolve to the same connection as their `wss://` form.
pub fn normalize_relay_url(url: &str) -> Result<String> {
    let with_scheme = if url.contains("://") { url.to_string() } else { format!("wss://{url}") };
    let parsed = url::Url::parse(&with_scheme)
        .map_err(|e| CoreError::Validation(format!("bad relay url: {e}")))?;
    let scheme = match parsed.scheme().to_lowercase().as_str() {
        "ws" => "ws",
        "wss" => "wss",
        "http" => "ws",
        "https" => "wss",
        other => return Err(CoreError::Validation(format!("unsupported relay scheme: {other}"))),
    };
    let host = parsed
        .host_str()
        .ok_or_else(|| CoreError::Validation("relay url has no host".into()))?
        .to_lowercase();
    let mut normalized = format!("{scheme}://{host}");
    if let Some(port) = parsed.port() {
        normalized.push_str(&format!(":{port}"));
    }
    let path = parsed.path().trim_end_matches('/');
    normalized.push_str(path);
    Ok(normalized)
}

struct Connection {
    state: RwLock<ConnectionState>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    active_subscriptions: AtomicUsize,
    backoff: Mutex<Duration>,
    next_attempt_at: Mutex<Option<Instant>>,
    opened_at: AtomicI64,
    /// Wall-clock ms at which `active_subscriptions` last dropped to
    /// zero; `0` means either never-idle or currently non-zero.
    idle_since: AtomicI64,
}

impl Connection {
    fn new() -> Self {
        Self {
            state: RwLock::new(ConnectionState::Disconnected),
            outbound: Mutex::new(None),
            active_subscriptions: AtomicUsize::new(0),
            backoff: Mutex::new(Duration::ZERO),
            next_attempt_at: Mutex::new(None),
            opened_at: AtomicI64::new(0),
            idle_since: AtomicI64::new(0),
        }
    }
}

/// Event pushed from a connection's reader task to the Subscription
/// Router, plus the one-shot app-lifecycle resume event.
#[derive(Debug)]
pub enum PoolEvent {
    Message { relay: String, message: RelayMessage },
    Disconnected { relay: String },
    ResumeRequested { relays: Vec<String>, filter: Filter },
}

type ResumeProvider = dyn Fn() -> (Vec<String>, Filter) + Send + Sync;

/// Owns exactly one [`Connection`] per normalized relay URL.
pub struct RelayPool {
    config: PoolConfig,
    connections: DashMap<String, Arc<Connection>>,
    inbound: mpsc::Sender<PoolEvent>,
    foreground: AtomicBool,
    previously_open: Mutex<Vec<String>>,
    resume_provider: RwLock<Option<Arc<ResumeProvider>>>,
}

impl RelayPool {
    pub fn new(config: PoolConfig, inbound: mpsc::Sender<PoolEvent>) -> Arc<Self> {
        let pool = Arc::new(Self {
            config,
            connections: DashMap::new(),
            inbound,
            foreground: AtomicBool::new(true),
            previously_open: Mutex::new(Vec::new()),
            resume_provider: RwLock::new(None),
        });
        pool.clone().spawn_idle_sweep();
        pool
    }

    /// Registered by C3 so the pool can restore the main feed
    /// subscription on foreground resume without clearing the displayed
    /// list.
    pub async fn set_resume_provider<F>(&self, provider: F)
    where
        F: Fn() -> (Vec<String>, Filter) + Send + Sync + 'static,
    {
        *self.resume_provider.write().await = Some(Arc::new(provider));
    }

    fn conn(&self, relay: &str) -> Arc<Connection> {
        self.connections.entry(relay.to_string()).or_insert_with(|| Arc::new(Connection::new())).clone()
    }

    pub async fn state(&self, relay: &str) -> ConnectionState {
        *self.conn(relay).state.read().await
    }

    /// Ensure `relay` is `Open`, connecting (through demand-driven
    /// backoff) if it is not. Returns once the connection is open or the
    /// connect attempt has failed.
    pub async fn ensure_open(&self, relay: &str) -> Result<()> {
        let normalized = normalize_relay_url(relay)?;
        let conn = self.conn(&normalized);

        if *conn.state.read().await == ConnectionState::Open {
            return Ok(());
        }

        {
            let next_attempt = *conn.next_attempt_at.lock().await;
            if let Some(at) = next_attempt {
                tokio::time::sleep_until(at).await;
            }
        }

        *conn.state.write().await = ConnectionState::Connecting;
        match tokio_tungstenite::connect_async(&normalized).await {
            Ok((stream, _)) => {
                let (mut write, mut read) = stream.split();
                let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
                *conn.outbound.lock().await = Some(out_tx);
                *conn.state.write().await = ConnectionState::Open;
                conn.opened_at.store(now_unix_ms(), Ordering::Relaxed);

                // Backoff resets only after the connection has stayed
                // open continuously for `backoff_reset_after`, not on
                // the bare fact of connecting.
                let reset_after = self.config.backoff_reset_after;
                let conn_for_reset = conn.clone();
                let opened_at_marker = conn.opened_at.load(Ordering::Relaxed);
                tokio::spawn(async move {
                    tokio::time::sleep(reset_after).await;
                    if *conn_for_reset.state.read().await == ConnectionState::Open
                        && conn_for_reset.opened_at.load(Ordering::Relaxed) == opened_at_marker
                    {
                        *conn_for_reset.backoff.lock().await = Duration::ZERO;
                    }
                });

                let relay_for_writer = normalized.clone();
                tokio::spawn(async move {
                    while let Some(frame) = out_rx.recv().await {
                        if write.send(Message::Text(frame)).await.is_err() {
                            tracing::warn!(relay = %relay_for_writer, "write failed, closing");
                            break;
                        }
                    }
                });

                let relay_for_reader = normalized.clone();
                let inbound = self.inbound.clone();
                let conn_for_reader = conn.clone();
                tokio::spawn(async move {
                    while let Some(frame) = read.next().await {
                        match frame {
                            Ok(Message::Text(text)) => match wire::parse_relay_message(&text) {
                                Ok(message) => {
                                    let _ = inbound
                                        .send(PoolEvent::Message { relay: relay_for_reader.clone(), message })
                                        .await;
                                }
                                Err(e) => tracing::warn!(relay = %relay_for_reader, error = %e, "malformed frame"),
                            },
                            Ok(Message::Close(_)) | Err(_) => break,
                            Ok(_) => {}
                        }
                    }
                    *conn_for_reader.state.write().await = ConnectionState::Disconnected;
                    *conn_for_reader.outbound.lock().await = None;
                    let _ = inbound.send(PoolEvent::Disconnected { relay: relay_for_reader }).await;
                });

                Ok(())
            }
            Err(e) => {
                *conn.state.write().await = ConnectionState::Disconnected;
                let mut backoff = conn.backoff.lock().await;
                *backoff = next_backoff(*backoff, &self.config);
                *conn.next_attempt_at.lock().await = Some(Instant::now() + *backoff);
                Err(CoreError::wire_io(normalized, e))
            }
        }
    }

    /// Send a raw frame to `relay`, connecting first if necessary.
    pub async fn send_frame(&self, relay: &str, frame: String) -> Result<()> {
        self.ensure_open(relay).await?;
        let conn = self.conn(&normalize_relay_url(relay)?);
        let sender = conn.outbound.lock().await.clone();
        match sender {
            Some(tx) => tx.send(frame).await.map_err(|_| {
                CoreError::Protocol(format!("relay {relay} writer task gone"))
            }),
            None => Err(CoreError::Protocol(format!("relay {relay} has no writer"))),
        }
    }

    /// Called by the Subscription Router when a subscription starts or
    /// stops referencing `relay`, so the idle-close sweep never closes a
    /// connection a live subscription depends on.
    pub fn adjust_subscription_count(&self, relay: &str, delta: i64) {
        let conn = self.conn(relay);
        let new_count = if delta >= 0 {
            conn.active_subscriptions.fetch_add(delta as usize, Ordering::Relaxed) + delta as usize
        } else {
            let dec = (-delta) as usize;
            let prev = conn
                .active_subscriptions
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(dec)))
                .unwrap_or(0);
            prev.saturating_sub(dec)
        };
        if new_count == 0 {
            conn.idle_since.store(now_unix_ms(), Ordering::Relaxed);
        } else {
            conn.idle_since.store(0, Ordering::Relaxed);
        }
    }

    fn spawn_idle_sweep(self: Arc<Self>) {
        let idle_timeout = self.config.idle_timeout;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(5));
            loop {
                tick.tick().await;
                let now = now_unix_ms();
                for entry in self.connections.iter() {
                    let conn = entry.value().clone();
                    if conn.active_subscriptions.load(Ordering::Relaxed) > 0 {
                        continue;
                    }
                    if *conn.state.read().await != ConnectionState::Open {
                        continue;
                    }
                    let idle_since = conn.idle_since.load(Ordering::Relaxed);
                    if idle_since == 0 {
                        continue;
                    }
                    if now.saturating_sub(idle_since) as u64 >= idle_timeout.as_millis() as u64 {
                        *conn.state.write().await = ConnectionState::Closing;
                        *conn.outbound.lock().await = None;
                        *conn.state.write().await = ConnectionState::Closed;
                    }
                }
            }
        });
    }

    /// App-lifecycle integration: on transition to background, eligible
    /// idle connections MAY close after `grace` (handled by the caller
    /// deferring the call); on return to foreground, previously-open
    /// relays are reconnected and the resume provider (if any) is
    /// consulted so the main feed subscription can be restored.
    pub async fn set_foreground(&self, foreground: bool) {
        let was_foreground = self.foreground.swap(foreground, Ordering::SeqCst);
        if foreground && !was_foreground {
            let relays: Vec<String> = {
                let guard = self.previously_open.lock().await;
                guard.clone()
            };
            for relay in &relays {
                let _ = self.ensure_open(relay).await;
            }
            if let Some(provider) = self.resume_provider.read().await.clone() {
                let (relays, filter) = provider();
                let _ = self.inbound.send(PoolEvent::ResumeRequested { relays, filter }).await;
            }
        } else if !foreground && was_foreground {
            let mut open = Vec::new();
            for entry in self.connections.iter() {
                if *entry.value().state.read().await == ConnectionState::Open {
                    open.push(entry.key().clone());
                }
            }
            *self.previously_open.lock().await = open;
        }
    }

    pub async fn connection_stats(&self) -> HashMap<String, ConnectionState> {
        let mut stats = HashMap::new();
        for entry in self.connections.iter() {
            stats.insert(entry.key().clone(), *entry.value().state.read().await);
        }
        stats
    }

    /// Explicit global disconnect: closes every connection immediately.
    pub async fn shutdown(&self) {
        for entry in self.connections.iter() {
            let conn = entry.value();
            *conn.outbound.lock().await = None;
            *conn.state.write().await = ConnectionState::Closed;
        }
    }
}

fn next_backoff(current: Duration, config: &PoolConfig) -> Duration {
    if current.is_zero() {
        config.backoff_initial
    } else {
        (current * 2).min(config.backoff_cap)
    }
}

fn now_unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_trailing_slash() {
        assert_eq!(
            normalize_relay_url("WSS://Relay.Example.COM/").unwrap(),
            "wss://relay.example.com"
        );
    }

    #[test]
    fn bare_host_and_https_both_normalize_to_wss() {
        assert_eq!(normalize_relay_url("relay.example").unwrap(), "wss://relay.example");
        assert_eq!(normalize_relay_url("https://relay.example").unwrap(), "wss://relay.example");
    }

    #[test]
    fn rejects_unsupported_scheme() {
        assert!(normalize_relay_url("ftp://relay.example.com").is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = PoolConfig::default();
        let b1 = next_backoff(Duration::ZERO, &config);
        assert_eq!(b1, config.backoff_initial);
        let b2 = next_backoff(b1, &config);
        assert_eq!(b2, config.backoff_initial * 2);
        let maxed = next_backoff(config.backoff_cap, &config);
        assert_eq!(maxed, config.backoff_cap);
    }
}
