// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Distributed key-value backend abstraction.
//!
//! Every coordination component talks to the store through the [`Backend`]
//! capability contract: `ping`, pipelined command execution, key scanning,
//! publish/subscribe and node listing. Two implementations exist:
//!
//! - [`redis::RedisBackend`]: single node, sharded cluster or sentinel HA,
//!   chosen once at startup from [`BackendConfig`](crate::config::BackendConfig)
//! - [`memory::MemoryBackend`]: in-process store with the same semantics,
//!   used for tests, demos and multi-process simulation
//!
//! Commands are a closed set of tagged variants rather than raw strings so the
//! in-process implementation can execute exactly what Redis would.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use crate::config::Topology;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend connection error: {0}")]
    Connection(String),
    #[error("Backend operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Backend command failed: {0}")]
    Command(String),
    #[error("Unexpected backend reply: {0}")]
    Protocol(String),
    #[error("Backend unavailable: circuit breaker open")]
    CircuitOpen,
}

impl BackendError {
    /// Whether this failure says something about connectivity (and therefore
    /// counts towards the circuit breaker) rather than about one command.
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }
}

/// One backend command. Each variant maps to a single Redis command or a
/// single server-side script, so it is atomic on its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `GET key` -> `Bulk` or `Nil`
    Get { key: String },
    /// `SET key value PX ttl` -> `Ok`
    SetEx { key: String, value: Vec<u8>, ttl: Duration },
    /// `SET key value NX PX ttl` -> `Ok` if set, `Nil` if the key exists
    SetNx { key: String, value: Vec<u8>, ttl: Duration },
    /// `DEL key` -> `Int(0|1)`
    Del { key: String },
    /// Fixed-window counter: `INCR`, `EXPIRE` when newly created, `PTTL`.
    /// -> `Array[Int(count), Int(remaining_ms)]`
    WindowIncr { key: String, ttl: Duration },
    /// Delete only if the stored value equals `value` -> `Int(0|1)`
    DeleteIfEquals { key: String, value: Vec<u8> },
    /// Reset the TTL only if the stored value equals `value` -> `Int(0|1)`
    ExpireIfEquals { key: String, value: Vec<u8>, ttl: Duration },
    /// `PUBLISH channel message` -> `Int(receivers)`
    Publish { channel: String, message: String },
}

impl Command {
    /// Key this command targets, if any (used for partition routing).
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Get { key }
            | Self::SetEx { key, .. }
            | Self::SetNx { key, .. }
            | Self::Del { key }
            | Self::WindowIncr { key, .. }
            | Self::DeleteIfEquals { key, .. }
            | Self::ExpireIfEquals { key, .. } => Some(key),
            Self::Publish { .. } => None,
        }
    }

    /// Cluster hash slot of the targeted key; `None` for keyless commands.
    #[must_use]
    pub fn slot(&self) -> Option<u16> {
        self.key().map(hash_slot)
    }

    /// Short name for logging and metrics labels.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Get { .. } => "get",
            Self::SetEx { .. } => "set",
            Self::SetNx { .. } => "setnx",
            Self::Del { .. } => "del",
            Self::WindowIncr { .. } => "window_incr",
            Self::DeleteIfEquals { .. } => "delete_if_equals",
            Self::ExpireIfEquals { .. } => "expire_if_equals",
            Self::Publish { .. } => "publish",
        }
    }
}

/// Redis Cluster hash slot for `key`: CRC16 over the key, or over its
/// `{hash tag}` when one is present.
#[must_use]
pub fn hash_slot(key: &str) -> u16 {
    ::redis::cluster_routing::get_slot(key.as_bytes())
}

/// Backend reply, normalized across implementations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Ok,
    Int(i64),
    Bulk(Vec<u8>),
    Array(Vec<Reply>),
}

impl Reply {
    /// Value of a `GET`-style reply.
    pub fn into_bytes(self) -> Result<Option<Vec<u8>>, BackendError> {
        match self {
            Self::Nil => Ok(None),
            Self::Bulk(bytes) => Ok(Some(bytes)),
            other => Err(BackendError::Protocol(format!("expected bulk or nil, got {:?}", other))),
        }
    }

    pub fn as_int(&self) -> Result<i64, BackendError> {
        match self {
            Self::Int(n) => Ok(*n),
            Self::Bulk(bytes) => std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| BackendError::Protocol("non-numeric bulk reply".into())),
            other => Err(BackendError::Protocol(format!("expected integer, got {:?}", other))),
        }
    }

    /// `Ok` (or a positive integer) means the conditional write happened.
    #[must_use]
    pub fn is_success(&self) -> bool {
        match self {
            Self::Ok => true,
            Self::Int(n) => *n > 0,
            _ => false,
        }
    }
}

/// A live channel subscription. Messages are forwarded by a background task
/// that is aborted when the subscription is dropped.
pub struct Subscription {
    channel: String,
    rx: mpsc::Receiver<String>,
    forwarder: JoinHandle<()>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, rx: mpsc::Receiver<String>, forwarder: JoinHandle<()>) -> Self {
        Self {
            channel: channel.into(),
            rx,
            forwarder,
        }
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next message payload; `None` once the underlying connection is gone.
    pub async fn next_message(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Capability contract shared by every topology.
#[async_trait]
pub trait Backend: Send + Sync {
    fn topology(&self) -> Topology;

    /// Physical nodes behind this handle.
    fn nodes(&self) -> Vec<String>;

    async fn ping(&self) -> Result<(), BackendError>;

    /// Execute a batch in one round trip. Replies are returned in command
    /// order; the batch is not a transaction across keys. Cluster backends
    /// require every keyed command in a batch to share one [`Command::slot`].
    async fn execute(&self, commands: Vec<Command>) -> Result<Vec<Reply>, BackendError>;

    /// All keys matching a glob pattern (cursor-based, non-blocking on the server).
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, BackendError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BackendError>;

    /// Single-command convenience wrapper around [`Backend::execute`].
    async fn execute_one(&self, command: Command) -> Result<Reply, BackendError> {
        let mut replies = self.execute(vec![command]).await?;
        replies
            .pop()
            .ok_or_else(|| BackendError::Protocol("empty reply for single command".into()))
    }

    /// Server memory in use, when the backend reports it.
    async fn memory_bytes(&self) -> Result<Option<u64>, BackendError> {
        Ok(None)
    }

    /// Cluster health string (e.g. "ok"/"fail"), for cluster topologies.
    async fn cluster_state(&self) -> Result<Option<String>, BackendError> {
        Ok(None)
    }
}

/// Builds backend handles. The connection manager calls this on startup and
/// again on every reconnection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Backend>, BackendError>;
}
