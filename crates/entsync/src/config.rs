// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Configuration structs for the pools, the batcher, and the servers.

use std::sync::Arc;

use crate::core::nack::SchemaNackPolicy;
use crate::core::registry::PropertyRegistry;
use crate::schema::SchemaRegistry;

/// Connection pool configuration.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionPoolConfig {
    /// Maximum simultaneous connections (typically 64-2048).
    pub capacity: usize,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Session pool configuration.
#[derive(Clone, Default)]
pub struct SessionPoolConfig {
    /// Maximum simultaneous sessions. Zero selects the default (512).
    pub capacity: usize,
    /// Shared property registry. When absent each session owns a private
    /// registry.
    pub property_registry: Option<Arc<PropertyRegistry>>,
    /// Schema registry for advertisement fan-out and NACK resolution.
    /// When absent, schema operations are unavailable and unknown-schema
    /// accounting never triggers.
    pub schema_registry: Option<Arc<SchemaRegistry>>,
    /// NACK policy for sessions of this manager.
    pub nack_policy: SchemaNackPolicy,
    /// Batching configuration applied to each session's batcher.
    pub batch: BatchConfig,
}

impl SessionPoolConfig {
    /// Configuration with the given capacity and defaults elsewhere.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    /// Attach a shared property registry.
    pub fn with_property_registry(mut self, registry: Arc<PropertyRegistry>) -> Self {
        self.property_registry = Some(registry);
        self
    }

    /// Attach a schema registry.
    pub fn with_schema_registry(mut self, registry: Arc<SchemaRegistry>) -> Self {
        self.schema_registry = Some(registry);
        self
    }

    /// Set the NACK policy.
    pub fn with_nack_policy(mut self, policy: SchemaNackPolicy) -> Self {
        self.nack_policy = policy;
        self
    }

    /// Set the batch configuration.
    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }
}

/// Property-update batcher configuration.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// Base flush interval in ms (default 16 ms = 60 Hz).
    pub interval_ms: u32,
    /// Batches allowed in flight before further flushes drop (default 3).
    pub max_pending_batches: u32,
    /// Ceiling for the dynamic interval under backpressure (default 100 ms).
    pub max_dynamic_interval_ms: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            interval_ms: 16,
            max_pending_batches: 3,
            max_dynamic_interval_ms: 100,
        }
    }
}

impl BatchConfig {
    /// Configuration with a custom base interval.
    pub fn with_interval_ms(mut self, interval_ms: u32) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    /// Set the in-flight batch allowance.
    pub fn with_max_pending_batches(mut self, max: u32) -> Self {
        self.max_pending_batches = max;
        self
    }

    /// Set the dynamic interval ceiling.
    pub fn with_max_dynamic_interval_ms(mut self, max_ms: u32) -> Self {
        self.max_dynamic_interval_ms = max_ms;
        self
    }
}

/// Remote acceptor configuration.
///
/// Port, backlog, and TLS concern the embedder's signaling server; they are
/// carried here so one struct travels from configuration to the signaling
/// layer. `polite` selects the perfect-negotiation role for adopted
/// channels (servers are conventionally impolite).
#[derive(Debug, Clone)]
pub struct RemoteServerConfig {
    /// Signaling port.
    pub port: u16,
    /// Accept backlog hint.
    pub backlog: u32,
    /// Poll interval for shutdown checks while accepting, in ms.
    pub accept_poll_interval_ms: u64,
    /// Perfect-negotiation politeness for adopted channels.
    pub polite: bool,
    /// STUN/TURN server URLs handed to channel adapters.
    pub ice_servers: Vec<String>,
}

impl Default for RemoteServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            backlog: 128,
            accept_poll_interval_ms: 100,
            polite: false,
            ice_servers: Vec::new(),
        }
    }
}

/// Local acceptor configuration.
#[derive(Debug, Clone)]
pub struct LocalServerConfig {
    /// Poll interval for shutdown checks while accepting, in ms.
    pub accept_poll_interval_ms: u64,
}

impl Default for LocalServerConfig {
    fn default() -> Self {
        Self {
            accept_poll_interval_ms: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(ConnectionPoolConfig::default().capacity, 1024);
        let batch = BatchConfig::default();
        assert_eq!(batch.interval_ms, 16);
        assert_eq!(batch.max_pending_batches, 3);
        assert_eq!(batch.max_dynamic_interval_ms, 100);
        assert_eq!(RemoteServerConfig::default().port, 8080);
    }

    #[test]
    fn test_builders() {
        let config = SessionPoolConfig::with_capacity(64)
            .with_nack_policy(SchemaNackPolicy::enabled())
            .with_batch(BatchConfig::default().with_interval_ms(50));
        assert_eq!(config.capacity, 64);
        assert!(config.nack_policy.enabled);
        assert_eq!(config.batch.interval_ms, 50);
    }
}
