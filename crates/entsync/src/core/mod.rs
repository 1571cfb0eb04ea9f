// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Core building blocks: error taxonomy, shared value types, the
//! generation-stamped slot pool, NACK rate limiting, and the
//! entity/property registry.

/// Error taxonomy and `Result` alias.
pub mod error;
/// Schema NACK policy, tracker, and log rate limiter.
pub mod nack;
/// Entity/property registry with hash-collision detection.
pub mod registry;
/// Generation-stamped slot pool (internal engine of the managers).
pub(crate) mod slot;
/// Connection state/stats, hashes, property values.
pub mod types;

pub use error::{NetworkError, Result};
pub use nack::{LogRateLimiter, NackTrackerConfig, SchemaNackPolicy, SchemaNackTracker};
pub use registry::{EntityRecord, PropertyInfo, PropertyRegistry};
pub use types::{
    compute_component_type_hash, compute_property_hash, ComponentTypeHash, ConnectionState,
    ConnectionStats, ConnectionType, PropertyHash, PropertyType, PropertyValue, Quat, Vec2, Vec3,
    Vec4,
};
