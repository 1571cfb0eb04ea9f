// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Entity and property registry.
//!
//! Maps entity ids to their records and 128-bit property hashes back to the
//! `(entity, name, type)` tuples they were computed from. Sessions resolve
//! incoming update hashes against this registry; a shared `Arc` instance can
//! back many sessions (server fan-in) or each session can own a private one.

use dashmap::DashMap;

use crate::core::error::{NetworkError, Result};
use crate::core::types::{PropertyHash, PropertyType, PropertyValue};

/// Record for a registered entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    /// Entity identifier, unique within the registry.
    pub entity_id: u64,
    /// Application identifier the entity belongs to.
    pub app_id: String,
    /// Entity type name.
    pub type_name: String,
    /// Parent entity id (0 for roots).
    pub parent_id: u64,
}

/// Resolution record for a property hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    /// Owning entity.
    pub entity_id: u64,
    /// Property name within the entity type.
    pub name: String,
    /// Registered value type.
    pub property_type: PropertyType,
}

/// Default entity capacity.
pub const DEFAULT_MAX_ENTITIES: usize = 65_536;
/// Default property capacity.
pub const DEFAULT_MAX_PROPERTIES: usize = 1_048_576;

/// Concurrent entity/property store with hash-collision detection.
pub struct PropertyRegistry {
    entities: DashMap<u64, EntityRecord>,
    properties: DashMap<PropertyHash, PropertyInfo>,
    max_entities: usize,
    max_properties: usize,
}

impl PropertyRegistry {
    /// Create a registry with default capacity bounds.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_ENTITIES, DEFAULT_MAX_PROPERTIES)
    }

    /// Create a registry with explicit capacity bounds.
    pub fn with_limits(max_entities: usize, max_properties: usize) -> Self {
        Self {
            entities: DashMap::new(),
            properties: DashMap::new(),
            max_entities,
            max_properties,
        }
    }

    /// Register an entity. Fails with `AlreadyExists` if the id is taken and
    /// `RegistryFull` at capacity.
    pub fn register_entity(&self, record: EntityRecord) -> Result<()> {
        if self.entities.len() >= self.max_entities {
            return Err(NetworkError::RegistryFull(format!(
                "entity capacity {} reached",
                self.max_entities
            )));
        }
        match self.entities.entry(record.entity_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(NetworkError::AlreadyExists(
                format!("entity {}", record.entity_id),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    /// Remove an entity and all of its registered properties.
    pub fn destroy_entity(&self, entity_id: u64) -> Result<EntityRecord> {
        let (_, record) = self
            .entities
            .remove(&entity_id)
            .ok_or(NetworkError::EntityNotFound(entity_id))?;
        self.properties.retain(|_, info| info.entity_id != entity_id);
        Ok(record)
    }

    /// Look up an entity record.
    pub fn entity(&self, entity_id: u64) -> Option<EntityRecord> {
        self.entities.get(&entity_id).map(|r| r.clone())
    }

    /// Register a property under its caller-computed hash.
    ///
    /// Re-registering the identical `(entity, name, type)` tuple is
    /// idempotent. The same tuple with a different type is `TypeMismatch`;
    /// a different tuple mapping to the same hash is `HashCollision`.
    pub fn register_property(&self, hash: PropertyHash, info: PropertyInfo) -> Result<()> {
        if !self.entities.contains_key(&info.entity_id) {
            return Err(NetworkError::EntityNotFound(info.entity_id));
        }
        if self.properties.len() >= self.max_properties {
            return Err(NetworkError::RegistryFull(format!(
                "property capacity {} reached",
                self.max_properties
            )));
        }
        match self.properties.entry(hash) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                let current = existing.get();
                if current.entity_id != info.entity_id || current.name != info.name {
                    return Err(NetworkError::HashCollision(format!(
                        "hash {} maps to {}:{} and {}:{}",
                        hash, current.entity_id, current.name, info.entity_id, info.name
                    )));
                }
                if current.property_type != info.property_type {
                    return Err(NetworkError::TypeMismatch(format!(
                        "property {}:{} re-registered with a different type",
                        info.entity_id, info.name
                    )));
                }
                Ok(())
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(info);
                Ok(())
            }
        }
    }

    /// Resolve a property hash back to its registration.
    pub fn resolve(&self, hash: PropertyHash) -> Result<PropertyInfo> {
        self.properties
            .get(&hash)
            .map(|info| info.clone())
            .ok_or_else(|| NetworkError::UnknownProperty(format!("hash {}", hash)))
    }

    /// Check that `value` matches the registered type for `hash`.
    pub fn validate_value(&self, hash: PropertyHash, value: &PropertyValue) -> Result<()> {
        let info = self.resolve(hash)?;
        if info.property_type != value.property_type() {
            return Err(NetworkError::TypeMismatch(format!(
                "property {}:{} expects {:?}, got {:?}",
                info.entity_id,
                info.name,
                info.property_type,
                value.property_type()
            )));
        }
        Ok(())
    }

    /// Number of registered entities.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Number of registered properties.
    pub fn property_count(&self) -> usize {
        self.properties.len()
    }
}

impl Default for PropertyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::compute_property_hash;

    fn entity(id: u64) -> EntityRecord {
        EntityRecord {
            entity_id: id,
            app_id: "demo".into(),
            type_name: "Cube".into(),
            parent_id: 0,
        }
    }

    #[test]
    fn test_entity_lifecycle() {
        let registry = PropertyRegistry::new();
        registry.register_entity(entity(1)).unwrap();
        assert!(matches!(
            registry.register_entity(entity(1)),
            Err(NetworkError::AlreadyExists(_))
        ));
        assert_eq!(registry.entity(1).unwrap().type_name, "Cube");

        registry.destroy_entity(1).unwrap();
        assert!(matches!(
            registry.destroy_entity(1),
            Err(NetworkError::EntityNotFound(1))
        ));
    }

    #[test]
    fn test_entity_capacity() {
        let registry = PropertyRegistry::with_limits(2, 16);
        registry.register_entity(entity(1)).unwrap();
        registry.register_entity(entity(2)).unwrap();
        assert!(matches!(
            registry.register_entity(entity(3)),
            Err(NetworkError::RegistryFull(_))
        ));
    }

    #[test]
    fn test_property_resolution() {
        let registry = PropertyRegistry::new();
        registry.register_entity(entity(1)).unwrap();
        let hash = compute_property_hash(1, "demo", "Cube", "position");
        registry
            .register_property(
                hash,
                PropertyInfo {
                    entity_id: 1,
                    name: "position".into(),
                    property_type: PropertyType::Vec3,
                },
            )
            .unwrap();

        let info = registry.resolve(hash).unwrap();
        assert_eq!(info.name, "position");
        assert!(matches!(
            registry.resolve(compute_property_hash(1, "demo", "Cube", "missing")),
            Err(NetworkError::UnknownProperty(_))
        ));
    }

    #[test]
    fn test_collision_and_type_mismatch() {
        let registry = PropertyRegistry::new();
        registry.register_entity(entity(1)).unwrap();
        registry.register_entity(entity(2)).unwrap();
        let hash = compute_property_hash(1, "demo", "Cube", "position");
        let info = PropertyInfo {
            entity_id: 1,
            name: "position".into(),
            property_type: PropertyType::Vec3,
        };
        registry.register_property(hash, info.clone()).unwrap();

        // Identical registration is idempotent.
        registry.register_property(hash, info.clone()).unwrap();

        // Same tuple, different type.
        assert!(matches!(
            registry.register_property(
                hash,
                PropertyInfo {
                    property_type: PropertyType::Float32,
                    ..info.clone()
                }
            ),
            Err(NetworkError::TypeMismatch(_))
        ));

        // Different tuple behind the same hash.
        assert!(matches!(
            registry.register_property(
                hash,
                PropertyInfo {
                    entity_id: 2,
                    name: "rotation".into(),
                    property_type: PropertyType::Quat,
                }
            ),
            Err(NetworkError::HashCollision(_))
        ));
    }

    #[test]
    fn test_validate_value() {
        let registry = PropertyRegistry::new();
        registry.register_entity(entity(1)).unwrap();
        let hash = compute_property_hash(1, "demo", "Cube", "visible");
        registry
            .register_property(
                hash,
                PropertyInfo {
                    entity_id: 1,
                    name: "visible".into(),
                    property_type: PropertyType::Bool,
                },
            )
            .unwrap();

        registry
            .validate_value(hash, &PropertyValue::Bool(true))
            .unwrap();
        assert!(matches!(
            registry.validate_value(hash, &PropertyValue::Int32(1)),
            Err(NetworkError::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_destroy_entity_drops_properties() {
        let registry = PropertyRegistry::new();
        registry.register_entity(entity(1)).unwrap();
        let hash = compute_property_hash(1, "demo", "Cube", "position");
        registry
            .register_property(
                hash,
                PropertyInfo {
                    entity_id: 1,
                    name: "position".into(),
                    property_type: PropertyType::Vec3,
                },
            )
            .unwrap();
        assert_eq!(registry.property_count(), 1);
        registry.destroy_entity(1).unwrap();
        assert_eq!(registry.property_count(), 0);
    }
}
