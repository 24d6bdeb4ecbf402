// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consistent-hash key partitioning.
//!
//! Each physical node gets `V` virtual points on a 32-bit ring at
//! `hash("<node>:<i>")`. A key belongs to the first point clockwise from
//! `hash(key)`, wrapping to the start of the ring.
//!
//! ```text
//!            0 ──────────────────────────────────────── 2^32
//!   points:  │ a:17   b:3    a:101   c:40   b:88  ...  │
//!   key k:          ▲ hash(k)
//!                   └──► owner = next point clockwise (b)
//! ```
//!
//! Adding or removing one node moves roughly `1/N` of the keys. The ring is
//! immutable; [`PartitioningStrategy::rebalance`] swaps in a new one.

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// First four bytes of SHA-256, big-endian.
#[must_use]
pub fn hash32(input: &str) -> u32 {
    let digest = Sha256::digest(input.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingEntry {
    pub hash: u32,
    pub node: Arc<str>,
}

/// Immutable sorted ring of virtual nodes.
#[derive(Debug, Clone)]
pub struct HashRing {
    entries: Vec<RingEntry>,
    nodes: Vec<String>,
    virtual_nodes: usize,
}

impl HashRing {
    #[must_use]
    pub fn new(nodes: &[String], virtual_nodes: usize) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(nodes.len());
        for node in nodes {
            if !unique.contains(node) {
                unique.push(node.clone());
            }
        }

        let mut entries = Vec::with_capacity(unique.len() * virtual_nodes);
        for node in &unique {
            let name: Arc<str> = Arc::from(node.as_str());
            for i in 0..virtual_nodes {
                entries.push(RingEntry {
                    hash: hash32(&format!("{}:{}", node, i)),
                    node: Arc::clone(&name),
                });
            }
        }
        // Node name breaks hash ties so the order never depends on input order
        entries.sort_by(|a, b| a.hash.cmp(&b.hash).then_with(|| a.node.cmp(&b.node)));

        Self {
            entries,
            nodes: unique,
            virtual_nodes,
        }
    }

    #[must_use]
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    /// Owner of `key`, or `None` for an empty ring.
    #[must_use]
    pub fn node_for_key(&self, key: &str) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }
        let h = hash32(key);
        let idx = self.entries.partition_point(|e| e.hash < h);
        let entry = self.entries.get(idx).unwrap_or(&self.entries[0]);
        Some(&entry.node)
    }

    /// Group keys by owning node. Order within each group follows input order.
    #[must_use]
    pub fn distribute<'a, I>(&self, keys: I) -> HashMap<String, Vec<String>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        for key in keys {
            if let Some(node) = self.node_for_key(key) {
                out.entry(node.to_string()).or_default().push(key.to_string());
            }
        }
        out
    }
}

/// Shared, swappable ring.
pub struct PartitioningStrategy {
    ring: RwLock<Arc<HashRing>>,
}

impl PartitioningStrategy {
    #[must_use]
    pub fn new(nodes: &[String], virtual_nodes: usize) -> Self {
        Self {
            ring: RwLock::new(Arc::new(HashRing::new(nodes, virtual_nodes))),
        }
    }

    /// Current ring snapshot.
    #[must_use]
    pub fn ring(&self) -> Arc<HashRing> {
        Arc::clone(&self.ring.read())
    }

    /// Modulo bucket of `hash(key)`; independent of the ring.
    /// `total_partitions == 0` is treated as a single partition.
    #[must_use]
    pub fn get_partition(&self, key: &str, total_partitions: u32) -> u32 {
        hash32(key) % total_partitions.max(1)
    }

    #[must_use]
    pub fn get_node_for_key(&self, key: &str) -> Option<String> {
        self.ring().node_for_key(key).map(str::to_string)
    }

    #[must_use]
    pub fn distribute_keys(&self, keys: &[String]) -> HashMap<String, Vec<String>> {
        self.ring().distribute(keys.iter().map(String::as_str))
    }

    /// Replace the ring with one built from `new_nodes` and return the full
    /// assignment of `keys` under it.
    pub fn rebalance(&self, new_nodes: &[String], keys: &[String]) -> HashMap<String, Vec<String>> {
        let virtual_nodes = self.ring.read().virtual_nodes();
        let ring = Arc::new(HashRing::new(new_nodes, virtual_nodes));
        let assignment = ring.distribute(keys.iter().map(String::as_str));
        let previous = std::mem::replace(&mut *self.ring.write(), ring);
        info!(
            before = previous.nodes().len(),
            after = new_nodes.len(),
            keys = keys.len(),
            "Hash ring rebalanced"
        );
        assignment
    }

    /// Keys currently owned by `removed_node`, i.e. the keys that must move
    /// when it leaves. Evaluated against the ring as it is now.
    #[must_use]
    pub fn keys_to_migrate(&self, removed_node: &str, all_keys: &[String]) -> Vec<String> {
        let ring = self.ring();
        all_keys
            .iter()
            .filter(|key| ring.node_for_key(key) == Some(removed_node))
            .cloned()
            .collect()
    }
}
