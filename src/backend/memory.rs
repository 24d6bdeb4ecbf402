// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process backend with Redis semantics.
//!
//! A [`MemoryBackend`] owns a shared keyspace with millisecond TTLs and a
//! broadcast-based pub/sub bus. [`MemoryBackend::peer`] hands out another
//! handle onto the same keyspace with its own link state, which is how tests
//! model several processes sharing one store while only some of them lose
//! connectivity.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use super::{Backend, BackendError, Command, Connector, Reply, Subscription, Topology};
use crate::clock::Clock;
use crate::pattern::glob_match;

const PUBSUB_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at_ms: Option<u64>,
}

impl Entry {
    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms.map_or(true, |at| now_ms < at)
    }
}

#[derive(Debug, Clone)]
struct Message {
    channel: String,
    payload: String,
}

struct SharedState {
    data: Mutex<HashMap<String, Entry>>,
    bus: broadcast::Sender<Message>,
    clock: Clock,
}

#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<SharedState>,
    /// Link state of this handle only
    online: Arc<AtomicBool>,
    name: String,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Clock::new())
    }

    #[must_use]
    pub fn with_clock(clock: Clock) -> Self {
        let (bus, _) = broadcast::channel(PUBSUB_CAPACITY);
        Self {
            shared: Arc::new(SharedState {
                data: Mutex::new(HashMap::new()),
                bus,
                clock,
            }),
            online: Arc::new(AtomicBool::new(true)),
            name: "memory://local".to_string(),
        }
    }

    /// Another handle onto the same keyspace and bus, with an independent link.
    #[must_use]
    pub fn peer(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            online: Arc::new(AtomicBool::new(true)),
            name: self.name.clone(),
        }
    }

    /// Simulate this handle losing (or regaining) connectivity.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Number of live keys, regardless of link state.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = self.shared.clock.now_ms();
        self.shared.data.lock().values().filter(|e| e.is_live(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_online(&self) -> Result<(), BackendError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(BackendError::Connection(format!("{} is unreachable", self.name)))
        }
    }

    fn apply(&self, data: &mut HashMap<String, Entry>, now: u64, command: Command) -> Reply {
        // Lazily drop an expired entry before looking at it
        if let Some(key) = command.key() {
            if data.get(key).is_some_and(|e| !e.is_live(now)) {
                data.remove(key);
            }
        }

        match command {
            Command::Get { key } => match data.get(&key) {
                Some(entry) => Reply::Bulk(entry.value.clone()),
                None => Reply::Nil,
            },
            Command::SetEx { key, value, ttl } => {
                data.insert(key, Entry { value, expires_at_ms: Some(now + ttl.as_millis() as u64) });
                Reply::Ok
            }
            Command::SetNx { key, value, ttl } => {
                if data.contains_key(&key) {
                    Reply::Nil
                } else {
                    data.insert(key, Entry { value, expires_at_ms: Some(now + ttl.as_millis() as u64) });
                    Reply::Ok
                }
            }
            Command::Del { key } => Reply::Int(i64::from(data.remove(&key).is_some())),
            Command::WindowIncr { key, ttl } => {
                let ttl_ms = ttl.as_millis() as u64;
                let entry = data.entry(key).or_insert_with(|| Entry {
                    value: b"0".to_vec(),
                    expires_at_ms: None,
                });
                let count = std::str::from_utf8(&entry.value)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .unwrap_or(0)
                    + 1;
                entry.value = count.to_string().into_bytes();
                if count == 1 {
                    entry.expires_at_ms = Some(now + ttl_ms);
                }
                let remaining = entry
                    .expires_at_ms
                    .map_or(-1, |at| at.saturating_sub(now) as i64);
                Reply::Array(vec![Reply::Int(count), Reply::Int(remaining)])
            }
            Command::DeleteIfEquals { key, value } => {
                if data.get(&key).is_some_and(|e| e.value == value) {
                    data.remove(&key);
                    Reply::Int(1)
                } else {
                    Reply::Int(0)
                }
            }
            Command::ExpireIfEquals { key, value, ttl } => match data.get_mut(&key) {
                Some(entry) if entry.value == value => {
                    entry.expires_at_ms = Some(now + ttl.as_millis() as u64);
                    Reply::Int(1)
                }
                _ => Reply::Int(0),
            },
            Command::Publish { channel, message } => {
                let receivers = self
                    .shared
                    .bus
                    .send(Message { channel, payload: message })
                    .unwrap_or(0);
                Reply::Int(receivers as i64)
            }
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn topology(&self) -> Topology {
        Topology::Single
    }

    fn nodes(&self) -> Vec<String> {
        vec![self.name.clone()]
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.ensure_online()
    }

    async fn execute(&self, commands: Vec<Command>) -> Result<Vec<Reply>, BackendError> {
        self.ensure_online()?;
        let now = self.shared.clock.now_ms();
        let mut data = self.shared.data.lock();
        Ok(commands
            .into_iter()
            .map(|command| self.apply(&mut data, now, command))
            .collect())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
        self.ensure_online()?;
        let now = self.shared.clock.now_ms();
        let data = self.shared.data.lock();
        let mut keys: Vec<String> = data
            .iter()
            .filter(|(key, entry)| entry.is_live(now) && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BackendError> {
        self.ensure_online()?;
        let mut bus = self.shared.bus.subscribe();
        let (tx, rx) = mpsc::channel(PUBSUB_CAPACITY);
        let wanted = channel.to_string();

        let forwarder = tokio::spawn(async move {
            loop {
                match bus.recv().await {
                    Ok(msg) if msg.channel == wanted => {
                        if tx.send(msg.payload).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(channel = %wanted, skipped, "Subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(channel, rx, forwarder))
    }

    async fn memory_bytes(&self) -> Result<Option<u64>, BackendError> {
        self.ensure_online()?;
        let data = self.shared.data.lock();
        let bytes: usize = data.iter().map(|(k, e)| k.len() + e.value.len()).sum();
        Ok(Some(bytes as u64))
    }
}

#[async_trait]
impl Connector for MemoryBackend {
    async fn connect(&self) -> Result<Arc<dyn Backend>, BackendError> {
        self.ensure_online()?;
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn millis(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    fn set(key: &str, value: &str, ttl_ms: u64) -> Command {
        Command::SetEx { key: key.into(), value: value.as_bytes().to_vec(), ttl: millis(ttl_ms) }
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_get_and_expiry() {
        let backend = MemoryBackend::new();
        backend.execute_one(set("k", "v", 1_000)).await.unwrap();

        let reply = backend.execute_one(Command::Get { key: "k".into() }).await.unwrap();
        assert_eq!(reply.into_bytes().unwrap(), Some(b"v".to_vec()));

        tokio::time::advance(millis(1_001)).await;
        let reply = backend.execute_one(Command::Get { key: "k".into() }).await.unwrap();
        assert_eq!(reply, Reply::Nil);
        assert!(backend.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_nx_only_once() {
        let backend = MemoryBackend::new();
        let cmd = Command::SetNx { key: "lock:r".into(), value: b"a".to_vec(), ttl: millis(500) };
        assert!(backend.execute_one(cmd.clone()).await.unwrap().is_success());
        assert!(!backend.execute_one(cmd.clone()).await.unwrap().is_success());

        // Expired lease can be taken again
        tokio::time::advance(millis(600)).await;
        assert!(backend.execute_one(cmd).await.unwrap().is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_incr_counts_and_reports_ttl() {
        let backend = MemoryBackend::new();
        let cmd = Command::WindowIncr { key: "rl:k".into(), ttl: millis(1_000) };

        let first = backend.execute_one(cmd.clone()).await.unwrap();
        assert_eq!(first, Reply::Array(vec![Reply::Int(1), Reply::Int(1_000)]));

        tokio::time::advance(millis(400)).await;
        let second = backend.execute_one(cmd.clone()).await.unwrap();
        assert_eq!(second, Reply::Array(vec![Reply::Int(2), Reply::Int(600)]));

        tokio::time::advance(millis(700)).await;
        let fresh = backend.execute_one(cmd).await.unwrap();
        assert_eq!(fresh, Reply::Array(vec![Reply::Int(1), Reply::Int(1_000)]));
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let backend = MemoryBackend::new();
        backend.execute_one(set("lock:r", "token-a", 10_000)).await.unwrap();

        let wrong = Command::DeleteIfEquals { key: "lock:r".into(), value: b"token-b".to_vec() };
        assert_eq!(backend.execute_one(wrong).await.unwrap(), Reply::Int(0));

        let right = Command::DeleteIfEquals { key: "lock:r".into(), value: b"token-a".to_vec() };
        assert_eq!(backend.execute_one(right).await.unwrap(), Reply::Int(1));
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_scan_matches_glob() {
        let backend = MemoryBackend::new();
        backend
            .execute(vec![set("app:user:1", "a", 10_000), set("app:user:2", "b", 10_000), set("app:task:1", "c", 10_000)])
            .await
            .unwrap();

        let keys = backend.scan("app:user:*").await.unwrap();
        assert_eq!(keys, vec!["app:user:1".to_string(), "app:user:2".to_string()]);
    }

    #[tokio::test]
    async fn test_offline_handle_fails_but_peer_works() {
        let a = MemoryBackend::new();
        let b = a.peer();
        a.execute_one(set("k", "v", 10_000)).await.unwrap();

        b.set_online(false);
        let err = b.execute_one(Command::Get { key: "k".into() }).await.unwrap_err();
        assert!(err.is_connectivity());
        assert!(b.ping().await.is_err());
        assert!(b.connect().await.is_err());

        // Same keyspace, independent link
        let reply = a.execute_one(Command::Get { key: "k".into() }).await.unwrap();
        assert!(reply.into_bytes().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pubsub_between_peers() {
        let a = MemoryBackend::new();
        let b = a.peer();
        let mut sub = b.subscribe("events").await.unwrap();

        a.execute_one(Command::Publish { channel: "other".into(), message: "skip".into() }).await.unwrap();
        a.execute_one(Command::Publish { channel: "events".into(), message: "hello".into() }).await.unwrap();

        assert_eq!(sub.channel(), "events");
        assert_eq!(sub.next_message().await.as_deref(), Some("hello"));
    }
}
