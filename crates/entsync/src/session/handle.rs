// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Generation-stamped session handles.
//!
//! The primary API surface for protocol operations. A handle carries
//! `(owner, index, generation)`; every call re-validates the stamp, then
//! holds the session slot's mutex for the duration of the call.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use crate::connection::ConnectionHandle;
use crate::core::error::{NetworkError, Result};
use crate::core::registry::PropertyRegistry;
use crate::core::types::{
    ComponentTypeHash, ConnectionState, ConnectionStats, PropertyHash, PropertyValue,
};
use crate::protocol::wire::{PropertyBatch, SceneSnapshotChunk};
use crate::schema::{ComponentSchema, PropertyMetadata};
use crate::session::batch::BatchStats;
use crate::session::machine::{
    EntityCreatedCallback, EntityDestroyedCallback, ErrorCallback, HandshakeCallback,
    HeartbeatCallback, PropertyUpdateCallback, SceneSnapshotCallback,
    SchemaAdvertisementCallback, SchemaNackCallback, SessionState,
};
use crate::session::manager::{SessionManagerInner, SessionSlot};

/// Generation-stamped handle to a session slot.
///
/// Copies share identity, not ownership; the session manager owns the
/// machine and `valid()` turns false the moment the slot is freed.
#[derive(Clone, Default)]
pub struct SessionHandle {
    owner: Weak<SessionManagerInner>,
    index: u32,
    generation: u32,
}

impl SessionHandle {
    pub(crate) fn new(owner: Weak<SessionManagerInner>, index: u32, generation: u32) -> Self {
        Self {
            owner,
            index,
            generation,
        }
    }

    pub(crate) fn owner(&self) -> &Weak<SessionManagerInner> {
        &self.owner
    }

    pub(crate) fn stamp(&self) -> (u32, u32) {
        (self.index, self.generation)
    }

    /// An invalid handle (no stamped identity).
    pub fn invalid() -> Self {
        Self::default()
    }

    /// Whether this handle still refers to a live session.
    pub fn valid(&self) -> bool {
        self.owner
            .upgrade()
            .is_some_and(|owner| owner.pool.is_valid(self.index, self.generation))
    }

    fn with_machine<R>(&self, f: impl FnOnce(&mut SessionSlot) -> Result<R>) -> Result<R> {
        let owner = self
            .owner
            .upgrade()
            .ok_or_else(|| NetworkError::InvalidParameter("invalid session handle".into()))?;
        owner.pool.with_slot(self.index, self.generation, f)
    }

    // ------------------------------------------------------------------
    // Handshake and lifecycle
    // ------------------------------------------------------------------

    /// Send our handshake; completion is signaled via the handshake
    /// callback when the peer's handshake arrives.
    pub fn perform_handshake(&self, client_type: &str, client_id: &str) -> Result<()> {
        self.with_machine(|slot| slot.machine.perform_handshake(client_type, client_id))
    }

    /// Whether the handshake has completed in both directions.
    pub fn handshake_complete(&self) -> bool {
        self.with_machine(|slot| Ok(slot.machine.handshake_complete()))
            .unwrap_or(false)
    }

    /// Session protocol state (`Closed` for invalid handles).
    pub fn state(&self) -> SessionState {
        self.with_machine(|slot| Ok(slot.machine.state()))
            .unwrap_or(SessionState::Closed)
    }

    /// Stable diagnostic id of the session.
    pub fn session_id(&self) -> Result<String> {
        self.with_machine(|slot| Ok(slot.machine.session_id().to_string()))
    }

    /// Peer identity learned from its handshake.
    pub fn peer_identity(&self) -> Result<Option<(String, String)>> {
        self.with_machine(|slot| Ok(slot.machine.peer_identity()))
    }

    /// Whether the underlying connection is established.
    pub fn is_connected(&self) -> bool {
        self.with_machine(|slot| Ok(slot.machine.is_connected()))
            .unwrap_or(false)
    }

    /// State of the underlying connection.
    pub fn connection_state(&self) -> ConnectionState {
        self.with_machine(|slot| Ok(slot.machine.connection_state()))
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Traffic statistics of the underlying connection.
    pub fn connection_stats(&self) -> ConnectionStats {
        self.with_machine(|slot| Ok(slot.machine.connection_stats()))
            .unwrap_or_default()
    }

    /// The wrapped connection handle.
    pub fn connection(&self) -> Result<ConnectionHandle> {
        self.with_machine(|slot| Ok(slot.connection.clone()))
    }

    /// The session's property registry (shared or private, per the pool
    /// configuration).
    pub fn property_registry(&self) -> Result<Arc<PropertyRegistry>> {
        self.with_machine(|slot| Ok(Arc::clone(slot.machine.property_registry())))
    }

    // ------------------------------------------------------------------
    // Entity and bulk sends
    // ------------------------------------------------------------------

    /// Announce an entity on the reliable channel.
    pub fn send_entity_created(
        &self,
        entity_id: u64,
        app_id: &str,
        type_name: &str,
        parent_id: u64,
    ) -> Result<()> {
        self.with_machine(|slot| {
            slot.machine.send_entity_created(
                entity_id,
                app_id,
                type_name,
                parent_id,
                ComponentTypeHash::ZERO,
                Vec::new(),
            )
        })
    }

    /// Announce a typed entity, with its schema hash and property set.
    pub fn send_entity_created_typed(
        &self,
        entity_id: u64,
        app_id: &str,
        type_name: &str,
        parent_id: u64,
        type_hash: ComponentTypeHash,
        properties: Vec<PropertyMetadata>,
    ) -> Result<()> {
        self.with_machine(|slot| {
            slot.machine
                .send_entity_created(entity_id, app_id, type_name, parent_id, type_hash, properties)
        })
    }

    /// Announce entity destruction on the reliable channel.
    pub fn send_entity_destroyed(&self, entity_id: u64) -> Result<()> {
        self.with_machine(|slot| slot.machine.send_entity_destroyed(entity_id))
    }

    /// Send one property update immediately (unreliable channel),
    /// bypassing the batcher.
    pub fn send_property_update(&self, hash: PropertyHash, value: PropertyValue) -> Result<()> {
        self.with_machine(|slot| slot.machine.send_property_update(hash, value))
    }

    /// Send a caller-assembled batch on the unreliable channel.
    pub fn send_property_update_batch(&self, batch: PropertyBatch) -> Result<()> {
        self.with_machine(|slot| slot.machine.send_property_update_batch(batch))
    }

    /// Send one scene snapshot chunk on the reliable channel.
    pub fn send_scene_snapshot_chunk(&self, chunk: SceneSnapshotChunk) -> Result<()> {
        self.with_machine(|slot| slot.machine.send_scene_snapshot_chunk(chunk))
    }

    /// Send an unchunked scene snapshot (a single chunk of one).
    pub fn send_scene_snapshot(&self, data: Vec<u8>) -> Result<()> {
        self.send_scene_snapshot_chunk(SceneSnapshotChunk {
            chunk_index: 0,
            chunk_count: 1,
            compressed: false,
            data,
        })
    }

    /// Send a liveness heartbeat on the reliable channel.
    pub fn send_heartbeat(&self) -> Result<()> {
        self.with_machine(|slot| slot.machine.send_heartbeat())
    }

    // ------------------------------------------------------------------
    // Schema sends
    // ------------------------------------------------------------------

    /// Register a schema with the peer.
    pub fn send_register_schema(&self, schema: ComponentSchema) -> Result<()> {
        self.with_machine(|slot| slot.machine.send_register_schema(schema))
    }

    /// Ask the peer for its public schemas; answers arrive as
    /// advertisements.
    pub fn send_query_public_schemas(&self) -> Result<()> {
        self.with_machine(|slot| slot.machine.send_query_public_schemas())
    }

    /// Ask the peer to publish a registered schema.
    pub fn send_publish_schema(&self, type_hash: ComponentTypeHash) -> Result<()> {
        self.with_machine(|slot| slot.machine.send_publish_schema(type_hash))
    }

    /// Ask the peer to withdraw a schema.
    pub fn send_unpublish_schema(&self, type_hash: ComponentTypeHash) -> Result<()> {
        self.with_machine(|slot| slot.machine.send_unpublish_schema(type_hash))
    }

    // ------------------------------------------------------------------
    // Batched property updates
    // ------------------------------------------------------------------

    /// Queue a property write; the latest value per hash wins at flush.
    pub fn update_property(&self, hash: PropertyHash, value: PropertyValue) -> Result<()> {
        self.with_machine(|slot| {
            slot.machine.update_property(hash, value);
            Ok(())
        })
    }

    /// Flush queued property writes as one batch on the unreliable
    /// channel.
    pub fn flush_property_updates(&self) -> Result<()> {
        self.with_machine(|slot| slot.machine.flush_property_updates())
    }

    /// Batcher statistics snapshot.
    pub fn batch_stats(&self) -> Result<BatchStats> {
        self.with_machine(|slot| Ok(slot.machine.batch_stats()))
    }

    /// Updates waiting for the next flush.
    pub fn pending_property_update_count(&self) -> usize {
        self.with_machine(|slot| Ok(slot.machine.pending_property_update_count()))
            .unwrap_or(0)
    }

    /// Interval the flush scheduler should use for its next tick, in ms.
    pub fn batch_interval_ms(&self) -> Result<u32> {
        self.with_machine(|slot| Ok(slot.machine.batch_interval_ms()))
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    pub fn duplicate_packet_count(&self) -> u64 {
        self.with_machine(|slot| Ok(slot.machine.duplicate_packet_count()))
            .unwrap_or(0)
    }

    pub fn packet_loss_event_count(&self) -> u64 {
        self.with_machine(|slot| Ok(slot.machine.packet_loss_event_count()))
            .unwrap_or(0)
    }

    pub fn sequence_update_failure_count(&self) -> u64 {
        self.with_machine(|slot| Ok(slot.machine.sequence_update_failure_count()))
            .unwrap_or(0)
    }

    pub fn unknown_schema_drop_count(&self) -> u64 {
        self.with_machine(|slot| Ok(slot.machine.unknown_schema_drop_count()))
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Callback registration
    // ------------------------------------------------------------------

    pub fn set_entity_created_callback(&self, callback: EntityCreatedCallback) -> Result<()> {
        self.with_machine(|slot| {
            slot.machine.set_entity_created_callback(callback);
            Ok(())
        })
    }

    pub fn set_entity_destroyed_callback(&self, callback: EntityDestroyedCallback) -> Result<()> {
        self.with_machine(|slot| {
            slot.machine.set_entity_destroyed_callback(callback);
            Ok(())
        })
    }

    pub fn set_property_update_callback(&self, callback: PropertyUpdateCallback) -> Result<()> {
        self.with_machine(|slot| {
            slot.machine.set_property_update_callback(callback);
            Ok(())
        })
    }

    pub fn set_scene_snapshot_callback(&self, callback: SceneSnapshotCallback) -> Result<()> {
        self.with_machine(|slot| {
            slot.machine.set_scene_snapshot_callback(callback);
            Ok(())
        })
    }

    pub fn set_handshake_callback(&self, callback: HandshakeCallback) -> Result<()> {
        self.with_machine(|slot| {
            slot.machine.set_handshake_callback(callback);
            Ok(())
        })
    }

    pub fn set_error_callback(&self, callback: ErrorCallback) -> Result<()> {
        self.with_machine(|slot| {
            slot.machine.set_error_callback(callback);
            Ok(())
        })
    }

    pub fn set_heartbeat_callback(&self, callback: HeartbeatCallback) -> Result<()> {
        self.with_machine(|slot| {
            slot.machine.set_heartbeat_callback(callback);
            Ok(())
        })
    }

    pub fn set_schema_nack_callback(&self, callback: SchemaNackCallback) -> Result<()> {
        self.with_machine(|slot| {
            slot.machine.set_schema_nack_callback(callback);
            Ok(())
        })
    }

    pub fn set_schema_advertisement_callback(
        &self,
        callback: SchemaAdvertisementCallback,
    ) -> Result<()> {
        self.with_machine(|slot| {
            slot.machine.set_schema_advertisement_callback(callback);
            Ok(())
        })
    }
}

impl PartialEq for SessionHandle {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.owner, &other.owner)
            && self.index == other.index
            && self.generation == other.generation
    }
}

impl Eq for SessionHandle {}

impl Hash for SessionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Weak::as_ptr(&self.owner) as usize).hash(state);
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.owner.upgrade().is_none() {
            write!(f, "SessionHandle(invalid)")
        } else {
            write!(
                f,
                "SessionHandle(index={}, gen={})",
                self.index, self.generation
            )
        }
    }
}
