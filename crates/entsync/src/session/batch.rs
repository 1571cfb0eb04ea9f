// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Property-update batcher.
//!
//! Absorbs bursts of per-property writes and emits periodic, deduplicated,
//! sequenced batches on the unreliable channel. The accumulator is a map
//! keyed by property hash, so a property updated many times between
//! flushes contributes one entry carrying its latest value.
//!
//! The batcher owns no threads: the application schedules `process_batch`
//! on whatever executor it has, at `current_interval_ms` spacing. Under
//! backpressure (too many batches in flight) a flush drops its batch and
//! the interval doubles, capped at the configured ceiling; once the
//! pipeline drains it recovers by 1 ms per successful flush back toward
//! the base interval.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::BatchConfig;
use crate::core::error::Result;
use crate::core::types::{unix_micros, PropertyHash, PropertyType, PropertyValue};
use crate::protocol::wire::{Message, PropertyBatch, PropertyUpdate};

/// Sink receiving built batches; the owning session's unreliable send path.
pub type BatchSink = Box<dyn Fn(Message) -> Result<()> + Send + Sync>;

struct PendingUpdate {
    property_type: PropertyType,
    value: PropertyValue,
    #[allow(dead_code)] // diagnostic, read by debuggers and future age-based drops
    modified: Instant,
}

/// Batcher statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchStats {
    /// Batches handed to the sink successfully.
    pub total_batches_sent: u64,
    /// Updates carried by those batches.
    pub total_updates_sent: u64,
    /// Batches dropped under backpressure.
    pub batches_dropped: u64,
    /// Writes that replaced a pending value for the same property.
    pub updates_deduped: u64,
    /// `total_updates_sent / max(total_batches_sent, 1)`.
    pub average_batch_size: u32,
    /// Dynamic interval at the last adjustment, in ms.
    pub current_batch_interval_ms: u32,
}

/// Deduplicating, rate-adaptive property-update aggregator.
pub struct BatchManager {
    config: BatchConfig,
    pending: Mutex<HashMap<PropertyHash, PendingUpdate>>,
    dynamic_interval_ms: AtomicU32,
    sequence: AtomicU32,
    pending_batches: AtomicU32,
    stats: Mutex<BatchStats>,
    sink: BatchSink,
}

impl BatchManager {
    /// Create a batcher dispatching through `sink`.
    pub fn new(config: BatchConfig, sink: BatchSink) -> Self {
        Self {
            config,
            pending: Mutex::new(HashMap::new()),
            dynamic_interval_ms: AtomicU32::new(config.interval_ms),
            sequence: AtomicU32::new(0),
            pending_batches: AtomicU32::new(0),
            stats: Mutex::new(BatchStats {
                current_batch_interval_ms: config.interval_ms,
                ..Default::default()
            }),
            sink,
        }
    }

    /// Record a property write. A pending value for the same hash is
    /// replaced (and counted as deduplicated); the latest value wins.
    pub fn update_property(&self, hash: PropertyHash, value: PropertyValue) {
        use std::collections::hash_map::Entry;

        let property_type = value.property_type();
        let deduped = {
            let mut pending = self.pending.lock();
            match pending.entry(hash) {
                Entry::Occupied(mut existing) => {
                    let update = existing.get_mut();
                    update.property_type = property_type;
                    update.value = value;
                    update.modified = Instant::now();
                    true
                }
                Entry::Vacant(slot) => {
                    slot.insert(PendingUpdate {
                        property_type,
                        value,
                        modified: Instant::now(),
                    });
                    false
                }
            }
        };
        if deduped {
            self.stats.lock().updates_deduped += 1;
        }
    }

    /// Flush pending updates as one batch.
    ///
    /// Called periodically by the application. Empty accumulator: no-op.
    /// Backpressure: the batch is dropped and the interval backs off.
    pub fn process_batch(&self) -> Result<()> {
        let updates: HashMap<PropertyHash, PendingUpdate> = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *pending)
        };

        if self.pending_batches.load(Ordering::Acquire) >= self.config.max_pending_batches {
            self.stats.lock().batches_dropped += 1;
            self.adjust_batch_rate();
            return Ok(());
        }
        self.pending_batches.fetch_add(1, Ordering::AcqRel);

        let update_count = updates.len() as u64;
        let message = Message::PropertyUpdateBatch(PropertyBatch {
            timestamp_us: unix_micros(),
            sequence: self.next_sequence(),
            updates: updates
                .into_iter()
                .map(|(property_hash, pending)| PropertyUpdate {
                    property_hash,
                    expected_type: pending.property_type,
                    value: pending.value,
                })
                .collect(),
        });

        let result = (self.sink)(message);
        self.pending_batches.fetch_sub(1, Ordering::AcqRel);

        if result.is_ok() {
            let mut stats = self.stats.lock();
            stats.total_batches_sent += 1;
            stats.total_updates_sent += update_count;
            stats.average_batch_size =
                (stats.total_updates_sent / stats.total_batches_sent.max(1)) as u32;
        }

        // Recover toward the base rate once the pipeline has drained.
        if result.is_ok() && self.pending_batches.load(Ordering::Acquire) == 0 {
            let dynamic = self.dynamic_interval_ms.load(Ordering::Acquire);
            if dynamic > self.config.interval_ms {
                let recovered = (dynamic - 1).max(self.config.interval_ms);
                self.dynamic_interval_ms.store(recovered, Ordering::Release);
                self.stats.lock().current_batch_interval_ms = recovered;
            }
        }

        result
    }

    /// Flush immediately. Alias for [`process_batch`](Self::process_batch).
    pub fn flush(&self) -> Result<()> {
        self.process_batch()
    }

    /// Replace the base interval; the dynamic interval resets with it.
    pub fn set_batch_interval(&mut self, interval_ms: u32) {
        self.config.interval_ms = interval_ms;
        self.dynamic_interval_ms.store(interval_ms, Ordering::Release);
        self.stats.lock().current_batch_interval_ms = interval_ms;
    }

    /// Configured base interval in ms.
    pub fn base_interval_ms(&self) -> u32 {
        self.config.interval_ms
    }

    /// Current (possibly backed-off) interval the application should use
    /// for its next flush tick.
    pub fn current_interval_ms(&self) -> u32 {
        self.dynamic_interval_ms.load(Ordering::Acquire)
    }

    /// Number of updates waiting for the next flush.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> BatchStats {
        *self.stats.lock()
    }

    /// Next batch sequence number (also used for single-shot sends that
    /// bypass the accumulator).
    pub fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn adjust_batch_rate(&self) {
        let current = self.dynamic_interval_ms.load(Ordering::Acquire);
        let backed_off = (current.saturating_mul(2)).min(self.config.max_dynamic_interval_ms);
        self.dynamic_interval_ms.store(backed_off, Ordering::Release);
        self.stats.lock().current_batch_interval_ms = backed_off;
    }
}

impl Drop for BatchManager {
    fn drop(&mut self) {
        // Last-chance flush; the link may already be gone.
        let _ = self.process_batch();
    }
}
