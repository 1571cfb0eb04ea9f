// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Schema NACK policy and rate-limit trackers.
//!
//! When a session receives a message referencing a component type hash it
//! does not know, it may send an advisory `SchemaNack` back to the peer.
//! NACKs are off by default and, when enabled, are rate limited per schema
//! so a hot entity stream cannot turn into NACK spam.
//!
//! The policy is a plain value published per session manager through an
//! `ArcSwap`, so hot paths read it without locks and operators can swap it
//! at runtime.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::core::types::ComponentTypeHash;

/// Policy governing schema NACK emission.
///
/// Recognized options and defaults match the batcher-facing configuration
/// table: NACKs disabled, 1000 ms per-schema spacing, burst of 1, 5000 ms
/// spacing for rate-limited unknown-schema logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaNackPolicy {
    /// Gate NACK emission globally. When false, unknown schemas are still
    /// counted and logged but nothing is sent.
    pub enabled: bool,
    /// Minimum interval between NACKs for the same schema, in ms.
    pub min_interval_ms: u32,
    /// Allowance before rate limiting engages.
    pub burst: u32,
    /// Spacing for rate-limited unknown-schema log lines, in ms.
    pub log_interval_ms: u32,
}

impl Default for SchemaNackPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            min_interval_ms: 1000,
            burst: 1,
            log_interval_ms: 5000,
        }
    }
}

impl SchemaNackPolicy {
    /// Policy with NACK emission enabled and default spacing.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    /// Set the per-schema minimum NACK interval.
    pub fn with_min_interval_ms(mut self, interval_ms: u32) -> Self {
        self.min_interval_ms = interval_ms;
        self
    }

    /// Set the burst allowance.
    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = burst;
        self
    }

    /// Set the unknown-schema log spacing.
    pub fn with_log_interval_ms(mut self, interval_ms: u32) -> Self {
        self.log_interval_ms = interval_ms;
        self
    }
}

/// Configuration for [`SchemaNackTracker`].
#[derive(Debug, Clone, Copy)]
pub struct NackTrackerConfig {
    /// Minimum interval between NACKs for the same schema.
    pub min_interval: Duration,
    /// Maximum number of schemas to track before pruning.
    pub max_tracked_schemas: usize,
}

impl Default for NackTrackerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(1000),
            max_tracked_schemas: 1000,
        }
    }
}

struct NackRecord {
    last_nack: Instant,
    count: u64,
}

struct TrackerInner {
    records: HashMap<ComponentTypeHash, NackRecord>,
    total_nacks_sent: u64,
}

/// Per-schema NACK rate limiter with bounded memory.
///
/// `should_send_nack` answers whether a NACK is due for a schema;
/// `record_nack_sent` stamps the send. When the tracked set exceeds the
/// configured maximum it is pruned to 75% of the maximum, dropping the
/// records with the oldest timestamps.
pub struct SchemaNackTracker {
    config: NackTrackerConfig,
    inner: Mutex<TrackerInner>,
}

impl SchemaNackTracker {
    /// Create a tracker with the default configuration.
    pub fn new() -> Self {
        Self::with_config(NackTrackerConfig::default())
    }

    /// Create a tracker with a custom configuration.
    pub fn with_config(config: NackTrackerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(TrackerInner {
                records: HashMap::new(),
                total_nacks_sent: 0,
            }),
        }
    }

    /// Whether a NACK should be sent for `type_hash` now, using the
    /// tracker's configured interval.
    pub fn should_send_nack(&self, type_hash: ComponentTypeHash) -> bool {
        self.should_send_nack_with(type_hash, self.config.min_interval)
    }

    /// Interval-overriding variant, used when the live policy carries a
    /// different spacing than the tracker was built with.
    pub fn should_send_nack_with(
        &self,
        type_hash: ComponentTypeHash,
        min_interval: Duration,
    ) -> bool {
        let inner = self.inner.lock();
        match inner.records.get(&type_hash) {
            None => true,
            Some(record) => record.last_nack.elapsed() >= min_interval,
        }
    }

    /// Record that a NACK was sent for `type_hash`.
    pub fn record_nack_sent(&self, type_hash: ComponentTypeHash) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let record = inner.records.entry(type_hash).or_insert(NackRecord {
            last_nack: now,
            count: 0,
        });
        record.last_nack = now;
        record.count += 1;
        inner.total_nacks_sent += 1;

        if inner.records.len() > self.config.max_tracked_schemas {
            Self::prune_oldest(&mut inner.records, self.config.max_tracked_schemas * 3 / 4);
        }
    }

    /// Total NACKs recorded over the tracker's lifetime (survives pruning).
    pub fn total_nacks_sent(&self) -> u64 {
        self.inner.lock().total_nacks_sent
    }

    /// Number of schemas currently tracked.
    pub fn unique_schemas(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Whether `type_hash` currently has a record (i.e. survived pruning).
    pub fn is_tracked(&self, type_hash: ComponentTypeHash) -> bool {
        self.inner.lock().records.contains_key(&type_hash)
    }

    /// Drop all tracked state and reset the total.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.records.clear();
        inner.total_nacks_sent = 0;
    }

    fn prune_oldest(records: &mut HashMap<ComponentTypeHash, NackRecord>, target: usize) {
        if records.len() <= target {
            return;
        }
        let mut by_age: Vec<(ComponentTypeHash, Instant)> = records
            .iter()
            .map(|(hash, record)| (*hash, record.last_nack))
            .collect();
        by_age.sort_by_key(|(_, last_nack)| *last_nack);
        let to_remove = records.len() - target;
        for (hash, _) in by_age.into_iter().take(to_remove) {
            records.remove(&hash);
        }
    }
}

impl Default for SchemaNackTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Keyed rate limiter for unknown-schema log lines.
///
/// Structurally the same spacing rule as the NACK tracker, but bounded by an
/// LRU cache instead of timestamp pruning: logging only needs approximate
/// per-key suppression, not an exact history.
pub struct LogRateLimiter {
    last_log: Mutex<LruCache<ComponentTypeHash, Instant>>,
}

impl LogRateLimiter {
    /// Create a limiter remembering up to `capacity` keys.
    pub fn new(capacity: usize) -> Self {
        Self {
            last_log: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    /// Whether a log line for `type_hash` is due, and if so, stamp it.
    pub fn should_log(&self, type_hash: ComponentTypeHash, interval: Duration) -> bool {
        let mut cache = self.last_log.lock();
        let now = Instant::now();
        if let Some(last) = cache.get_mut(&type_hash) {
            if last.elapsed() < interval {
                return false;
            }
            *last = now;
            return true;
        }
        cache.put(type_hash, now);
        true
    }
}
