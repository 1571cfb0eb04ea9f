// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Component schemas and the publish/unpublish registry.
//!
//! Schemas describe component types by 128-bit hash. A registry instance is
//! shared (`Arc`) between application code and session managers; managers
//! subscribe to publish/unpublish events and fan advertisements out to
//! their handshake-complete sessions.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::core::error::{NetworkError, Result};
use crate::core::types::{ComponentTypeHash, PropertyType};

/// One field of a component schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaField {
    /// Field name.
    pub name: String,
    /// Field value type.
    pub field_type: PropertyType,
}

/// Property descriptor attached to an `EntityCreated` announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyMetadata {
    /// Property name.
    pub name: String,
    /// Property value type.
    pub property_type: PropertyType,
}

/// A component schema, addressed by its type hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentSchema {
    /// 128-bit schema identity.
    pub type_hash: ComponentTypeHash,
    /// Owning application id.
    pub app_id: String,
    /// Component name within the application.
    pub component_name: String,
    /// Schema version.
    pub version: u32,
    /// Field list. May be empty for schemas known only by advertisement.
    pub fields: Vec<SchemaField>,
}

/// Registry event delivered to subscribers.
#[derive(Debug, Clone)]
pub enum SchemaEvent {
    /// A schema entered the public set.
    Published(ComponentSchema),
    /// A schema left the public set.
    Unpublished(ComponentTypeHash),
}

/// Subscriber callback for registry events.
pub type SchemaListener = Arc<dyn Fn(&SchemaEvent) + Send + Sync>;

/// Concurrent schema store with a public subset and event subscribers.
pub struct SchemaRegistry {
    schemas: DashMap<ComponentTypeHash, ComponentSchema>,
    public_set: DashMap<ComponentTypeHash, ()>,
    listeners: Mutex<Vec<SchemaListener>>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            schemas: DashMap::new(),
            public_set: DashMap::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Register a schema. Re-registering an identical schema is idempotent;
    /// a different schema under the same hash is `AlreadyExists`.
    pub fn register(&self, schema: ComponentSchema) -> Result<()> {
        match self.schemas.entry(schema.type_hash) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                if *existing.get() == schema {
                    return Ok(());
                }
                // A field-less placeholder from an advertisement may be
                // upgraded by the full definition.
                if existing.get().fields.is_empty() && !schema.fields.is_empty() {
                    existing.insert(schema);
                    return Ok(());
                }
                Err(NetworkError::AlreadyExists(format!(
                    "schema {}",
                    schema.type_hash
                )))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(schema);
                Ok(())
            }
        }
    }

    /// Record a schema known only from a peer advertisement (hash, names,
    /// version, no fields). Keeps unknown-schema accounting from firing on
    /// types the peer has told us about.
    pub fn note_advertised(
        &self,
        type_hash: ComponentTypeHash,
        app_id: &str,
        component_name: &str,
        version: u32,
    ) {
        self.schemas.entry(type_hash).or_insert_with(|| ComponentSchema {
            type_hash,
            app_id: app_id.to_string(),
            component_name: component_name.to_string(),
            version,
            fields: Vec::new(),
        });
    }

    /// Whether `type_hash` is known (registered or advertised).
    pub fn is_known(&self, type_hash: ComponentTypeHash) -> bool {
        self.schemas.contains_key(&type_hash)
    }

    /// Fetch a schema by hash.
    pub fn get(&self, type_hash: ComponentTypeHash) -> Option<ComponentSchema> {
        self.schemas.get(&type_hash).map(|s| s.clone())
    }

    /// Mark a registered schema public and notify subscribers.
    pub fn publish(&self, type_hash: ComponentTypeHash) -> Result<()> {
        let schema = self.get(type_hash).ok_or_else(|| {
            NetworkError::InvalidParameter(format!("schema {} not registered", type_hash))
        })?;
        if self.public_set.insert(type_hash, ()).is_some() {
            return Ok(()); // already public, no re-announcement
        }
        self.notify(&SchemaEvent::Published(schema));
        Ok(())
    }

    /// Withdraw a schema from the public set and notify subscribers.
    pub fn unpublish(&self, type_hash: ComponentTypeHash) -> Result<()> {
        if self.public_set.remove(&type_hash).is_none() {
            return Ok(()); // not public, nothing to announce
        }
        self.notify(&SchemaEvent::Unpublished(type_hash));
        Ok(())
    }

    /// Whether a schema is currently public.
    pub fn is_public(&self, type_hash: ComponentTypeHash) -> bool {
        self.public_set.contains_key(&type_hash)
    }

    /// Snapshot of all public schemas.
    pub fn public_schemas(&self) -> Vec<ComponentSchema> {
        self.public_set
            .iter()
            .filter_map(|entry| self.get(*entry.key()))
            .collect()
    }

    /// Number of registered schemas.
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Subscribe to publish/unpublish events. Subscribers must be brief and
    /// must not call back into the registry.
    pub fn subscribe(&self, listener: SchemaListener) {
        self.listeners.lock().push(listener);
    }

    fn notify(&self, event: &SchemaEvent) {
        // Clone the list so the lock is not held across callbacks.
        let listeners: Vec<SchemaListener> = self.listeners.lock().clone();
        for listener in listeners {
            listener(event);
        }
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}
