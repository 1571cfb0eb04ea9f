// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session protocol machine.
//!
//! One machine per session slot: it owns the handshake gate, message
//! framing and routing, sequence accounting, the property-update batcher,
//! and the unknown-schema NACK path. The machine never owns its transport;
//! it drives the connection through a generation-validated handle, so
//! transport and session lifetimes stay decoupled.
//!
//! Callbacks are invoked while the session slot mutex is held: they must be
//! brief and must not re-enter operations on the same session.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::config::BatchConfig;
use crate::connection::ConnectionHandle;
use crate::core::error::{NetworkError, Result};
use crate::core::nack::{LogRateLimiter, NackTrackerConfig, SchemaNackPolicy, SchemaNackTracker};
use crate::core::registry::PropertyRegistry;
use crate::core::types::{
    unix_millis, ComponentTypeHash, ConnectionState, ConnectionStats, PropertyHash, PropertyValue,
};
use crate::protocol::wire::{
    decode_envelope, encode_envelope, Message, PropertyBatch, PropertyUpdate, SceneSnapshotChunk,
};
use crate::schema::{ComponentSchema, PropertyMetadata, SchemaRegistry};
use crate::session::batch::{BatchManager, BatchSink, BatchStats};

/// Protocol version carried in handshakes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Keys remembered by the per-session unknown-schema log limiter.
const LOG_LIMITER_CAPACITY: usize = 256;

/// Bounded retries for the receive-sequence CAS loop.
const SEQUENCE_CAS_RETRIES: u32 = 16;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no handshake traffic yet.
    New,
    /// Our handshake is on the wire; waiting for the peer's.
    HandshakeSent,
    /// Peer handshake received; user operations unblocked.
    HandshakeComplete,
    /// Carrying user traffic.
    Active,
    /// Teardown in progress.
    Closing,
    /// Torn down.
    Closed,
    /// Terminal: unrecoverable transport error.
    Failed,
}

impl SessionState {
    fn as_u8(self) -> u8 {
        match self {
            SessionState::New => 0,
            SessionState::HandshakeSent => 1,
            SessionState::HandshakeComplete => 2,
            SessionState::Active => 3,
            SessionState::Closing => 4,
            SessionState::Closed => 5,
            SessionState::Failed => 6,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => SessionState::HandshakeSent,
            2 => SessionState::HandshakeComplete,
            3 => SessionState::Active,
            4 => SessionState::Closing,
            5 => SessionState::Closed,
            6 => SessionState::Failed,
            _ => SessionState::New,
        }
    }
}

/// Callback invoked on `EntityCreated`:
/// `(entity_id, app_id, type_name, parent_id, properties)`.
pub type EntityCreatedCallback = Arc<dyn Fn(u64, &str, &str, u64, &[PropertyMetadata]) + Send + Sync>;
/// Callback invoked on `EntityDestroyed` with the entity id.
pub type EntityDestroyedCallback = Arc<dyn Fn(u64) + Send + Sync>;
/// Callback invoked with each received property-update batch.
pub type PropertyUpdateCallback = Arc<dyn Fn(&PropertyBatch) + Send + Sync>;
/// Callback invoked with each received scene snapshot chunk.
pub type SceneSnapshotCallback = Arc<dyn Fn(&SceneSnapshotChunk) + Send + Sync>;
/// Callback invoked when the peer's handshake arrives: `(client_type, client_id)`.
pub type HandshakeCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;
/// Callback invoked for receive-side failures.
pub type ErrorCallback = Arc<dyn Fn(&NetworkError) + Send + Sync>;
/// Callback invoked on `Heartbeat` with the peer timestamp (ms).
pub type HeartbeatCallback = Arc<dyn Fn(u64) + Send + Sync>;
/// Callback invoked on `SchemaNack`: `(type_hash, reason, timestamp_ms)`.
pub type SchemaNackCallback = Arc<dyn Fn(ComponentTypeHash, &str, u64) + Send + Sync>;
/// Callback invoked on `SchemaAdvertisement`:
/// `(type_hash, app_id, component_name, schema_version)`.
pub type SchemaAdvertisementCallback = Arc<dyn Fn(ComponentTypeHash, &str, &str, u32) + Send + Sync>;

#[derive(Default)]
struct SessionCallbacks {
    entity_created: Option<EntityCreatedCallback>,
    entity_destroyed: Option<EntityDestroyedCallback>,
    property_update: Option<PropertyUpdateCallback>,
    scene_snapshot: Option<SceneSnapshotCallback>,
    handshake: Option<HandshakeCallback>,
    error: Option<ErrorCallback>,
    heartbeat: Option<HeartbeatCallback>,
    schema_nack: Option<SchemaNackCallback>,
    schema_advertisement: Option<SchemaAdvertisementCallback>,
}

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_session_id() -> String {
    format!(
        "sess-{:012x}-{:04x}",
        unix_millis(),
        SESSION_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Per-link protocol state machine.
pub struct NetworkSession {
    session_id: String,
    connection: ConnectionHandle,

    state: AtomicU8,
    handshake_complete: Arc<AtomicBool>,
    client_type: Mutex<String>,
    client_id: Mutex<String>,
    peer_identity: Mutex<Option<(String, String)>>,

    next_send_sequence: Arc<AtomicU32>,
    last_received_sequence: AtomicU32,

    duplicate_packets_received: AtomicU64,
    packet_loss_events: AtomicU64,
    sequence_update_failures: AtomicU64,
    unknown_schema_drops: AtomicU64,
    pre_handshake_drops: AtomicU64,

    nack_tracker: SchemaNackTracker,
    log_limiter: LogRateLimiter,
    nack_policy: Arc<ArcSwap<SchemaNackPolicy>>,

    batcher: BatchManager,

    property_registry: Arc<PropertyRegistry>,
    schema_registry: Option<Arc<SchemaRegistry>>,

    /// Last transport state observed through the connection's state
    /// callback. Written lock-free from transport threads.
    transport_state: Arc<AtomicU8>,

    callbacks: SessionCallbacks,

    shutting_down: AtomicBool,
    active_callbacks: AtomicU32,
}

impl NetworkSession {
    /// Build a machine bound to `connection`.
    pub(crate) fn new(
        connection: ConnectionHandle,
        property_registry: Arc<PropertyRegistry>,
        schema_registry: Option<Arc<SchemaRegistry>>,
        nack_policy: Arc<ArcSwap<SchemaNackPolicy>>,
        batch_config: BatchConfig,
    ) -> Self {
        let handshake_complete = Arc::new(AtomicBool::new(false));
        let next_send_sequence = Arc::new(AtomicU32::new(0));

        // The batcher dispatches through the session's unreliable send
        // path: handshake gate, envelope sequence, then the connection.
        let sink: BatchSink = {
            let connection = connection.clone();
            let handshake_complete = Arc::clone(&handshake_complete);
            let next_send_sequence = Arc::clone(&next_send_sequence);
            Box::new(move |message: Message| {
                if !handshake_complete.load(Ordering::Acquire) {
                    return Err(NetworkError::HandshakeFailed(
                        "handshake not complete".into(),
                    ));
                }
                let sequence = next_send_sequence
                    .fetch_add(1, Ordering::Relaxed)
                    .wrapping_add(1);
                let frame = encode_envelope(sequence, &message)?;
                connection.send_unreliable(&frame)
            })
        };

        let policy = nack_policy.load_full();
        let tracker_config = NackTrackerConfig {
            min_interval: Duration::from_millis(u64::from(policy.min_interval_ms)),
            ..Default::default()
        };

        Self {
            session_id: generate_session_id(),
            connection,
            state: AtomicU8::new(SessionState::New.as_u8()),
            handshake_complete,
            client_type: Mutex::new(String::new()),
            client_id: Mutex::new(String::new()),
            peer_identity: Mutex::new(None),
            next_send_sequence,
            last_received_sequence: AtomicU32::new(0),
            duplicate_packets_received: AtomicU64::new(0),
            packet_loss_events: AtomicU64::new(0),
            sequence_update_failures: AtomicU64::new(0),
            unknown_schema_drops: AtomicU64::new(0),
            pre_handshake_drops: AtomicU64::new(0),
            nack_tracker: SchemaNackTracker::with_config(tracker_config),
            log_limiter: LogRateLimiter::new(LOG_LIMITER_CAPACITY),
            nack_policy,
            batcher: BatchManager::new(batch_config, sink),
            property_registry,
            schema_registry,
            transport_state: Arc::new(AtomicU8::new(ConnectionState::Disconnected.as_u8())),
            callbacks: SessionCallbacks::default(),
            shutting_down: AtomicBool::new(false),
            active_callbacks: AtomicU32::new(0),
        }
    }

    // ------------------------------------------------------------------
    // Identity and state
    // ------------------------------------------------------------------

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// The cell the connection's state callback writes into; wired by the
    /// session manager at creation.
    pub(crate) fn transport_state_cell(&self) -> Arc<AtomicU8> {
        Arc::clone(&self.transport_state)
    }

    /// Session state, folding in the last observed transport state.
    pub fn state(&self) -> SessionState {
        let state = SessionState::from_u8(self.state.load(Ordering::Acquire));
        if matches!(
            state,
            SessionState::Closing | SessionState::Closed | SessionState::Failed
        ) {
            return state;
        }
        match ConnectionState::from_u8(self.transport_state.load(Ordering::Acquire)) {
            ConnectionState::Failed => SessionState::Failed,
            _ => state,
        }
    }

    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        self.connection.stats()
    }

    pub fn property_registry(&self) -> &Arc<PropertyRegistry> {
        &self.property_registry
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    pub fn duplicate_packet_count(&self) -> u64 {
        self.duplicate_packets_received.load(Ordering::Relaxed)
    }

    pub fn packet_loss_event_count(&self) -> u64 {
        self.packet_loss_events.load(Ordering::Relaxed)
    }

    pub fn sequence_update_failure_count(&self) -> u64 {
        self.sequence_update_failures.load(Ordering::Relaxed)
    }

    pub fn unknown_schema_drop_count(&self) -> u64 {
        self.unknown_schema_drops.load(Ordering::Relaxed)
    }

    pub fn pre_handshake_drop_count(&self) -> u64 {
        self.pre_handshake_drops.load(Ordering::Relaxed)
    }

    pub fn nack_tracker(&self) -> &SchemaNackTracker {
        &self.nack_tracker
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    /// Emit our handshake on the reliable channel.
    pub fn perform_handshake(&self, client_type: &str, client_id: &str) -> Result<()> {
        match self.state() {
            SessionState::Closing | SessionState::Closed | SessionState::Failed => {
                return Err(NetworkError::HandshakeFailed(format!(
                    "session is {:?}",
                    self.state()
                )))
            }
            SessionState::HandshakeSent => {
                return Err(NetworkError::HandshakeFailed(
                    "handshake already sent".into(),
                ))
            }
            _ => {}
        }

        *self.client_type.lock() = client_type.to_string();
        *self.client_id.lock() = client_id.to_string();

        self.send_message(&Message::Handshake {
            client_type: client_type.to_string(),
            client_id: client_id.to_string(),
            protocol_version: PROTOCOL_VERSION,
        })?;

        // Only New advances; a session whose peer spoke first stays
        // HandshakeComplete/Active.
        let _ = self.state.compare_exchange(
            SessionState::New.as_u8(),
            SessionState::HandshakeSent.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sends
    // ------------------------------------------------------------------

    pub fn send_entity_created(
        &self,
        entity_id: u64,
        app_id: &str,
        type_name: &str,
        parent_id: u64,
        type_hash: ComponentTypeHash,
        properties: Vec<PropertyMetadata>,
    ) -> Result<()> {
        self.send_message(&Message::EntityCreated {
            entity_id,
            app_id: app_id.to_string(),
            type_name: type_name.to_string(),
            parent_id,
            type_hash,
            properties,
        })
    }

    pub fn send_entity_destroyed(&self, entity_id: u64) -> Result<()> {
        self.send_message(&Message::EntityDestroyed { entity_id })
    }

    /// Immediate single-update batch, bypassing the accumulator.
    pub fn send_property_update(&self, hash: PropertyHash, value: PropertyValue) -> Result<()> {
        let batch = PropertyBatch {
            timestamp_us: crate::core::types::unix_micros(),
            sequence: self.batcher.next_sequence(),
            updates: vec![PropertyUpdate {
                property_hash: hash,
                expected_type: value.property_type(),
                value,
            }],
        };
        self.send_message(&Message::PropertyUpdateBatch(batch))
    }

    /// Send a caller-assembled batch.
    pub fn send_property_update_batch(&self, batch: PropertyBatch) -> Result<()> {
        self.send_message(&Message::PropertyUpdateBatch(batch))
    }

    pub fn send_scene_snapshot_chunk(&self, chunk: SceneSnapshotChunk) -> Result<()> {
        self.send_message(&Message::SceneSnapshotChunk(chunk))
    }

    pub fn send_heartbeat(&self) -> Result<()> {
        self.send_message(&Message::Heartbeat {
            timestamp_ms: unix_millis(),
        })
    }

    pub fn send_register_schema(&self, schema: ComponentSchema) -> Result<()> {
        self.send_message(&Message::RegisterSchema { schema })
    }

    pub fn send_query_public_schemas(&self) -> Result<()> {
        self.send_message(&Message::QueryPublicSchemas)
    }

    pub fn send_publish_schema(&self, type_hash: ComponentTypeHash) -> Result<()> {
        self.send_message(&Message::PublishSchema { type_hash })
    }

    pub fn send_unpublish_schema(&self, type_hash: ComponentTypeHash) -> Result<()> {
        self.send_message(&Message::UnpublishSchema { type_hash })
    }

    pub fn send_schema_advertisement(
        &self,
        type_hash: ComponentTypeHash,
        app_id: &str,
        component_name: &str,
        schema_version: u32,
    ) -> Result<()> {
        self.send_message(&Message::SchemaAdvertisement {
            type_hash,
            app_id: app_id.to_string(),
            component_name: component_name.to_string(),
            schema_version,
        })
    }

    /// Send an unknown-schema NACK, subject to the policy gate and the
    /// per-schema rate limit. `Ok(())` when disabled or rate limited.
    pub fn send_schema_nack(&self, type_hash: ComponentTypeHash, reason: &str) -> Result<()> {
        let policy = self.nack_policy.load();
        if !policy.enabled {
            return Ok(());
        }
        let min_interval = Duration::from_millis(u64::from(policy.min_interval_ms));
        if !self.nack_tracker.should_send_nack_with(type_hash, min_interval) {
            return Ok(());
        }
        self.send_message(&Message::SchemaNack {
            type_hash,
            reason: reason.to_string(),
            timestamp_ms: unix_millis(),
        })?;
        self.nack_tracker.record_nack_sent(type_hash);
        Ok(())
    }

    fn send_message(&self, message: &Message) -> Result<()> {
        if !matches!(message, Message::Handshake { .. })
            && !self.handshake_complete.load(Ordering::Acquire)
        {
            return Err(NetworkError::HandshakeFailed(
                "handshake not complete".into(),
            ));
        }
        let sequence = self
            .next_send_sequence
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        let frame = encode_envelope(sequence, message)?;
        let result = if message.is_unreliable() {
            self.connection.send_unreliable(&frame)
        } else {
            self.connection.send(&frame)
        };
        if result.is_ok() {
            self.touch_active();
        }
        result
    }

    fn touch_active(&self) {
        let _ = self.state.compare_exchange(
            SessionState::HandshakeComplete.as_u8(),
            SessionState::Active.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    // ------------------------------------------------------------------
    // Batching
    // ------------------------------------------------------------------

    /// Queue a property write for the next batch flush.
    pub fn update_property(&self, hash: PropertyHash, value: PropertyValue) {
        self.batcher.update_property(hash, value);
    }

    /// Flush queued property writes as one batch.
    pub fn flush_property_updates(&self) -> Result<()> {
        self.batcher.flush()
    }

    pub fn batch_stats(&self) -> BatchStats {
        self.batcher.stats()
    }

    pub fn pending_property_update_count(&self) -> usize {
        self.batcher.pending_count()
    }

    /// Interval the flush scheduler should use for its next tick, in ms.
    pub fn batch_interval_ms(&self) -> u32 {
        self.batcher.current_interval_ms()
    }

    // ------------------------------------------------------------------
    // Callback registration
    // ------------------------------------------------------------------

    pub fn set_entity_created_callback(&mut self, callback: EntityCreatedCallback) {
        self.callbacks.entity_created = Some(callback);
    }

    pub fn set_entity_destroyed_callback(&mut self, callback: EntityDestroyedCallback) {
        self.callbacks.entity_destroyed = Some(callback);
    }

    pub fn set_property_update_callback(&mut self, callback: PropertyUpdateCallback) {
        self.callbacks.property_update = Some(callback);
    }

    pub fn set_scene_snapshot_callback(&mut self, callback: SceneSnapshotCallback) {
        self.callbacks.scene_snapshot = Some(callback);
    }

    pub fn set_handshake_callback(&mut self, callback: HandshakeCallback) {
        self.callbacks.handshake = Some(callback);
    }

    pub fn set_error_callback(&mut self, callback: ErrorCallback) {
        self.callbacks.error = Some(callback);
    }

    pub fn set_heartbeat_callback(&mut self, callback: HeartbeatCallback) {
        self.callbacks.heartbeat = Some(callback);
    }

    pub fn set_schema_nack_callback(&mut self, callback: SchemaNackCallback) {
        self.callbacks.schema_nack = Some(callback);
    }

    pub fn set_schema_advertisement_callback(&mut self, callback: SchemaAdvertisementCallback) {
        self.callbacks.schema_advertisement = Some(callback);
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Deserialize and dispatch one incoming frame. Invoked with the slot
    /// mutex held. Malformed frames are reported through the error
    /// callback; they never terminate the link.
    pub fn handle_frame(&mut self, data: &[u8]) {
        let envelope = match decode_envelope(data) {
            Ok(envelope) => envelope,
            Err(error) => {
                self.report_error(&error);
                return;
            }
        };

        self.track_receive_sequence(envelope.sequence);

        if !self.handshake_complete()
            && !matches!(envelope.message, Message::Handshake { .. })
        {
            // Dropped silently (no NACK); counted for diagnostics.
            self.pre_handshake_drops.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match envelope.message {
            Message::Handshake {
                client_type,
                client_id,
                protocol_version,
            } => self.on_handshake(client_type, client_id, protocol_version),
            Message::EntityCreated {
                entity_id,
                app_id,
                type_name,
                parent_id,
                type_hash,
                properties,
            } => {
                if !self.check_schema_known(type_hash) {
                    return;
                }
                self.touch_active();
                let callback = self.callbacks.entity_created.clone();
                self.invoke(|| {
                    if let Some(cb) = callback {
                        cb(entity_id, &app_id, &type_name, parent_id, &properties);
                    }
                });
            }
            Message::EntityDestroyed { entity_id } => {
                self.touch_active();
                let callback = self.callbacks.entity_destroyed.clone();
                self.invoke(|| {
                    if let Some(cb) = callback {
                        cb(entity_id);
                    }
                });
            }
            Message::PropertyUpdateBatch(batch) => {
                self.touch_active();
                let callback = self.callbacks.property_update.clone();
                self.invoke(|| {
                    if let Some(cb) = callback {
                        cb(&batch);
                    }
                });
            }
            Message::SceneSnapshotChunk(chunk) => {
                self.touch_active();
                let callback = self.callbacks.scene_snapshot.clone();
                self.invoke(|| {
                    if let Some(cb) = callback {
                        cb(&chunk);
                    }
                });
            }
            Message::SchemaAdvertisement {
                type_hash,
                app_id,
                component_name,
                schema_version,
            } => {
                if let Some(registry) = &self.schema_registry {
                    registry.note_advertised(type_hash, &app_id, &component_name, schema_version);
                }
                let callback = self.callbacks.schema_advertisement.clone();
                self.invoke(|| {
                    if let Some(cb) = callback {
                        cb(type_hash, &app_id, &component_name, schema_version);
                    }
                });
            }
            Message::SchemaNack {
                type_hash,
                reason,
                timestamp_ms,
            } => {
                log::debug!(
                    "session {}: peer NACKed schema {}: {}",
                    self.session_id,
                    type_hash,
                    reason
                );
                let callback = self.callbacks.schema_nack.clone();
                self.invoke(|| {
                    if let Some(cb) = callback {
                        cb(type_hash, &reason, timestamp_ms);
                    }
                });
            }
            Message::RegisterSchema { schema } => match &self.schema_registry {
                Some(registry) => {
                    if let Err(error) = registry.register(schema) {
                        self.report_error(&error);
                    }
                }
                None => {
                    self.report_error(&NetworkError::InvalidMessage(
                        "no schema registry configured".into(),
                    ));
                }
            },
            Message::QueryPublicSchemas => {
                if let Some(registry) = &self.schema_registry {
                    for schema in registry.public_schemas() {
                        // Best-effort: one failed advertisement must not
                        // starve the rest of the answer.
                        let _ = self.send_schema_advertisement(
                            schema.type_hash,
                            &schema.app_id,
                            &schema.component_name,
                            schema.version,
                        );
                    }
                }
            }
            Message::PublishSchema { type_hash } => {
                if let Some(registry) = &self.schema_registry {
                    if let Err(error) = registry.publish(type_hash) {
                        self.report_error(&error);
                    }
                }
            }
            Message::UnpublishSchema { type_hash } => {
                if let Some(registry) = &self.schema_registry {
                    if let Err(error) = registry.unpublish(type_hash) {
                        self.report_error(&error);
                    }
                }
            }
            Message::Heartbeat { timestamp_ms } => {
                let callback = self.callbacks.heartbeat.clone();
                self.invoke(|| {
                    if let Some(cb) = callback {
                        cb(timestamp_ms);
                    }
                });
            }
        }
    }

    fn on_handshake(&mut self, client_type: String, client_id: String, protocol_version: u32) {
        if protocol_version != PROTOCOL_VERSION {
            log::warn!(
                "session {}: peer protocol version {} (ours {})",
                self.session_id,
                protocol_version,
                PROTOCOL_VERSION
            );
        }
        *self.peer_identity.lock() = Some((client_type.clone(), client_id.clone()));
        self.handshake_complete.store(true, Ordering::Release);

        let current = SessionState::from_u8(self.state.load(Ordering::Acquire));
        if matches!(current, SessionState::New | SessionState::HandshakeSent) {
            self.state
                .store(SessionState::HandshakeComplete.as_u8(), Ordering::Release);
        }

        let callback = self.callbacks.handshake.clone();
        self.invoke(|| {
            if let Some(cb) = callback {
                cb(&client_type, &client_id);
            }
        });
    }

    /// Peer identity learned from its handshake.
    pub fn peer_identity(&self) -> Option<(String, String)> {
        self.peer_identity.lock().clone()
    }

    /// Our own identity as sent in `perform_handshake` (empty before).
    pub fn local_identity(&self) -> (String, String) {
        (self.client_type.lock().clone(), self.client_id.lock().clone())
    }

    /// Returns false (after running the unknown-schema path) when the
    /// message must be dropped.
    fn check_schema_known(&self, type_hash: ComponentTypeHash) -> bool {
        if type_hash.is_zero() {
            return true;
        }
        let Some(registry) = &self.schema_registry else {
            return true;
        };
        if registry.is_known(type_hash) {
            return true;
        }
        self.handle_unknown_schema(type_hash);
        false
    }

    fn handle_unknown_schema(&self, type_hash: ComponentTypeHash) {
        let drops = self.unknown_schema_drops.fetch_add(1, Ordering::Relaxed) + 1;

        let policy = self.nack_policy.load();
        let log_interval = Duration::from_millis(u64::from(policy.log_interval_ms));
        if self.log_limiter.should_log(type_hash, log_interval) {
            log::warn!(
                "session {}: dropping message for unknown schema {} ({} drops so far)",
                self.session_id,
                type_hash,
                drops
            );
        }

        // Advisory; a send failure is swallowed and the record not stamped,
        // so the next occurrence retries.
        let _ = self.send_schema_nack(type_hash, "schema not found in registry");
    }

    fn track_receive_sequence(&self, sequence: u32) {
        let mut last = self.last_received_sequence.load(Ordering::Relaxed);
        let mut retries = 0;
        loop {
            if sequence <= last {
                self.duplicate_packets_received
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
            match self.last_received_sequence.compare_exchange_weak(
                last,
                sequence,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let gap = sequence - last - 1;
                    if gap > 0 {
                        self.packet_loss_events
                            .fetch_add(u64::from(gap), Ordering::Relaxed);
                    }
                    return;
                }
                Err(actual) => {
                    last = actual;
                    retries += 1;
                    if retries >= SEQUENCE_CAS_RETRIES {
                        // Counted, never failed: sequence tracking is
                        // diagnostic only.
                        self.sequence_update_failures
                            .fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
            }
        }
    }

    fn report_error(&self, error: &NetworkError) {
        let callback = self.callbacks.error.clone();
        self.invoke(|| {
            if let Some(cb) = callback {
                cb(error);
            }
        });
    }

    fn invoke(&self, f: impl FnOnce()) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        self.active_callbacks.fetch_add(1, Ordering::AcqRel);
        f();
        self.active_callbacks.fetch_sub(1, Ordering::AcqRel);
    }

    /// Begin teardown: block further callbacks, flush pending updates once.
    pub(crate) fn begin_close(&self) {
        self.state
            .store(SessionState::Closing.as_u8(), Ordering::Release);
        self.shutting_down.store(true, Ordering::Release);
        let _ = self.batcher.flush();
        self.state
            .store(SessionState::Closed.as_u8(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionPoolConfig;

    fn detached_machine(policy: SchemaNackPolicy) -> NetworkSession {
        let config = SessionPoolConfig::default().with_nack_policy(policy);
        NetworkSession::new(
            ConnectionHandle::invalid(),
            Arc::new(PropertyRegistry::new()),
            Some(Arc::new(SchemaRegistry::new())),
            Arc::new(ArcSwap::from_pointee(config.nack_policy)),
            config.batch,
        )
    }

    fn frame(sequence: u32, message: &Message) -> Vec<u8> {
        encode_envelope(sequence, message).expect("encode")
    }

    fn handshake_frame(sequence: u32) -> Vec<u8> {
        frame(
            sequence,
            &Message::Handshake {
                client_type: "test".into(),
                client_id: "peer".into(),
                protocol_version: PROTOCOL_VERSION,
            },
        )
    }

    #[test]
    fn test_handshake_gate_blocks_sends() {
        let machine = detached_machine(SchemaNackPolicy::default());
        assert_eq!(machine.state(), SessionState::New);
        let err = machine.send_entity_destroyed(1).unwrap_err();
        assert!(matches!(err, NetworkError::HandshakeFailed(_)));
    }

    #[test]
    fn test_peer_handshake_opens_gate() {
        let mut machine = detached_machine(SchemaNackPolicy::default());
        machine.handle_frame(&handshake_frame(1));
        assert!(machine.handshake_complete());
        assert_eq!(machine.state(), SessionState::HandshakeComplete);
        assert_eq!(
            machine.peer_identity(),
            Some(("test".into(), "peer".into()))
        );
        // The gate opens even though sends still fail on the dead handle.
        let err = machine.send_entity_destroyed(1).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidParameter(_)));
    }

    #[test]
    fn test_pre_handshake_messages_dropped_without_nack() {
        let mut machine = detached_machine(SchemaNackPolicy::enabled());
        let destroyed = frame(1, &Message::EntityDestroyed { entity_id: 5 });
        machine.handle_frame(&destroyed);
        assert_eq!(machine.pre_handshake_drop_count(), 1);
        assert_eq!(machine.nack_tracker().total_nacks_sent(), 0);
        assert_eq!(machine.unknown_schema_drop_count(), 0);
    }

    #[test]
    fn test_sequence_accounting() {
        let mut machine = detached_machine(SchemaNackPolicy::default());
        machine.handle_frame(&handshake_frame(1));

        // In-order heartbeats.
        machine.handle_frame(&frame(2, &Message::Heartbeat { timestamp_ms: 0 }));
        assert_eq!(machine.duplicate_packet_count(), 0);
        assert_eq!(machine.packet_loss_event_count(), 0);

        // A gap of 3 (seq 3, 4, 5 lost).
        machine.handle_frame(&frame(6, &Message::Heartbeat { timestamp_ms: 0 }));
        assert_eq!(machine.packet_loss_event_count(), 3);

        // A duplicate / reordered frame.
        machine.handle_frame(&frame(4, &Message::Heartbeat { timestamp_ms: 0 }));
        assert_eq!(machine.duplicate_packet_count(), 1);
    }

    #[test]
    fn test_malformed_frame_reports_error_keeps_link() {
        let mut machine = detached_machine(SchemaNackPolicy::default());
        let errors: Arc<Mutex<Vec<NetworkError>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let errors = Arc::clone(&errors);
            machine.set_error_callback(Arc::new(move |error: &NetworkError| {
                errors.lock().push(error.clone());
            }));
        }
        machine.handle_frame(&[0xEE, 1, 2, 3]);
        machine.handle_frame(&[]);
        let errors = errors.lock();
        assert_eq!(errors.len(), 2);
        assert!(matches!(errors[0], NetworkError::InvalidMessage(_)));
        // The session is still usable (not Failed).
        assert_ne!(machine.state(), SessionState::Failed);
    }

    #[test]
    fn test_entity_created_dispatch() {
        let mut machine = detached_machine(SchemaNackPolicy::default());
        machine.handle_frame(&handshake_frame(1));

        let seen: Arc<Mutex<Vec<(u64, String, String, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            machine.set_entity_created_callback(Arc::new(
                move |entity_id, app_id: &str, type_name: &str, parent_id, _props: &[PropertyMetadata]| {
                    seen.lock()
                        .push((entity_id, app_id.into(), type_name.into(), parent_id));
                },
            ));
        }

        machine.handle_frame(&frame(
            2,
            &Message::EntityCreated {
                entity_id: 11,
                app_id: "demo".into(),
                type_name: "Cube".into(),
                parent_id: 3,
                type_hash: ComponentTypeHash::ZERO,
                properties: Vec::new(),
            },
        ));
        assert_eq!(
            seen.lock().clone(),
            vec![(11, "demo".into(), "Cube".into(), 3)]
        );
        assert_eq!(machine.state(), SessionState::Active);
    }

    #[test]
    fn test_unknown_schema_dropped_and_counted() {
        let mut machine = detached_machine(SchemaNackPolicy::default());
        machine.handle_frame(&handshake_frame(1));

        let seen = Arc::new(Mutex::new(0usize));
        {
            let seen = Arc::clone(&seen);
            machine.set_entity_created_callback(Arc::new(move |_, _, _, _, _| {
                *seen.lock() += 1;
            }));
        }

        let unknown = ComponentTypeHash::new(0xBAD, 0xC0DE);
        for sequence in 2..5u32 {
            machine.handle_frame(&frame(
                sequence,
                &Message::EntityCreated {
                    entity_id: 1,
                    app_id: "demo".into(),
                    type_name: "Mystery".into(),
                    parent_id: 0,
                    type_hash: unknown,
                    properties: Vec::new(),
                },
            ));
        }

        assert_eq!(*seen.lock(), 0);
        assert_eq!(machine.unknown_schema_drop_count(), 3);
        // Policy disabled: counted but never NACKed.
        assert_eq!(machine.nack_tracker().total_nacks_sent(), 0);
    }

    #[test]
    fn test_known_schema_not_dropped() {
        let mut machine = detached_machine(SchemaNackPolicy::default());
        machine.handle_frame(&handshake_frame(1));
        let registry = machine.schema_registry.clone().unwrap();
        let type_hash = ComponentTypeHash::new(7, 7);
        registry.note_advertised(type_hash, "demo", "Known", 1);

        machine.handle_frame(&frame(
            2,
            &Message::EntityCreated {
                entity_id: 1,
                app_id: "demo".into(),
                type_name: "Known".into(),
                parent_id: 0,
                type_hash,
                properties: Vec::new(),
            },
        ));
        assert_eq!(machine.unknown_schema_drop_count(), 0);
    }

    #[test]
    fn test_heartbeat_dispatch() {
        let mut machine = detached_machine(SchemaNackPolicy::default());
        machine.handle_frame(&handshake_frame(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            machine.set_heartbeat_callback(Arc::new(move |ts| seen.lock().push(ts)));
        }
        machine.handle_frame(&frame(2, &Message::Heartbeat { timestamp_ms: 777 }));
        assert_eq!(seen.lock().clone(), vec![777]);
    }

    #[test]
    fn test_begin_close_blocks_callbacks() {
        let mut machine = detached_machine(SchemaNackPolicy::default());
        machine.handle_frame(&handshake_frame(1));
        let seen = Arc::new(Mutex::new(0usize));
        {
            let seen = Arc::clone(&seen);
            machine.set_heartbeat_callback(Arc::new(move |_| *seen.lock() += 1));
        }
        machine.begin_close();
        assert_eq!(machine.state(), SessionState::Closed);
        machine.handle_frame(&frame(2, &Message::Heartbeat { timestamp_ms: 1 }));
        assert_eq!(*seen.lock(), 0);
    }

    #[test]
    fn test_session_ids_unique() {
        let a = detached_machine(SchemaNackPolicy::default());
        let b = detached_machine(SchemaNackPolicy::default());
        assert_ne!(a.session_id(), b.session_id());
        assert!(a.session_id().starts_with("sess-"));
    }
}
