// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session manager: slot pool of protocol machines.
//!
//! Builds on the connection manager: each session slot holds a machine
//! bound to a connection handle. The manager rewires the connection's
//! callbacks so incoming frames dispatch into the machine through the
//! generation-validated slot: transport and session never own each other.
//!
//! When a schema registry is configured the manager subscribes to its
//! publish/unpublish events and fans advertisements out to every
//! handshake-complete session, using per-slot `try_lock` so one slow
//! session cannot hold up the rest (advertisements are idempotent; skipped
//! peers recover via `QueryPublicSchemas`).

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;

use crate::config::SessionPoolConfig;
use crate::connection::ConnectionHandle;
use crate::core::error::{NetworkError, Result};
use crate::core::nack::SchemaNackPolicy;
use crate::core::registry::PropertyRegistry;
use crate::core::slot::SlotPool;
use crate::core::types::ComponentTypeHash;
use crate::schema::{ComponentSchema, SchemaEvent, SchemaRegistry};
use crate::session::handle::SessionHandle;
use crate::session::machine::NetworkSession;

const DEFAULT_SESSION_CAPACITY: usize = 512;

pub(crate) struct SessionSlot {
    pub(crate) connection: ConnectionHandle,
    pub(crate) machine: NetworkSession,
}

pub(crate) struct SessionManagerInner {
    pub(crate) pool: SlotPool<SessionSlot>,
    policy: Arc<ArcSwap<SchemaNackPolicy>>,
    config: SessionPoolConfig,
}

impl SessionManagerInner {
    pub(crate) fn dispatch_incoming(&self, index: u32, generation: u32, data: &[u8]) {
        // A stale generation means the session is gone; the frame is
        // dropped, which is exactly what a closed session should do.
        let _ = self.pool.with_slot(index, generation, |slot| {
            slot.machine.handle_frame(data);
            Ok(())
        });
    }

    fn broadcast_advertisement(&self, schema: &ComponentSchema) {
        self.pool.try_for_each(|_, slot| {
            if slot.machine.handshake_complete() {
                if let Err(error) = slot.machine.send_schema_advertisement(
                    schema.type_hash,
                    &schema.app_id,
                    &schema.component_name,
                    schema.version,
                ) {
                    log::debug!(
                        "schema advertisement to session {} failed: {}",
                        slot.machine.session_id(),
                        error
                    );
                }
            }
        });
    }

    fn broadcast_unpublish(&self, type_hash: ComponentTypeHash) {
        self.pool.try_for_each(|_, slot| {
            if slot.machine.handshake_complete() {
                if let Err(error) = slot.machine.send_unpublish_schema(type_hash) {
                    log::debug!(
                        "schema unpublish to session {} failed: {}",
                        slot.machine.session_id(),
                        error
                    );
                }
            }
        });
    }
}

/// Slot-pool owner of session machines; issues [`SessionHandle`]s.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionManagerInner>,
}

impl SessionManager {
    /// Create a manager with `capacity` session slots and defaults
    /// elsewhere.
    pub fn new(capacity: usize) -> Self {
        Self::with_config(SessionPoolConfig::with_capacity(capacity))
    }

    /// Create a manager from a configuration struct.
    pub fn with_config(config: SessionPoolConfig) -> Self {
        let capacity = if config.capacity == 0 {
            DEFAULT_SESSION_CAPACITY
        } else {
            config.capacity
        };
        let policy = Arc::new(ArcSwap::from_pointee(config.nack_policy.clone()));
        let inner = Arc::new(SessionManagerInner {
            pool: SlotPool::new(capacity),
            policy,
            config,
        });

        // Advertisement fan-out rides the registry's publish signal. The
        // subscription holds a weak reference so a dropped manager's
        // listener degrades to a no-op.
        if let Some(registry) = &inner.config.schema_registry {
            let weak: Weak<SessionManagerInner> = Arc::downgrade(&inner);
            registry.subscribe(Arc::new(move |event: &SchemaEvent| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match event {
                    SchemaEvent::Published(schema) => inner.broadcast_advertisement(schema),
                    SchemaEvent::Unpublished(type_hash) => inner.broadcast_unpublish(*type_hash),
                }
            }));
        }

        Self { inner }
    }

    /// Create a session wrapping `connection`.
    ///
    /// The connection's message and state callbacks are rewired to the new
    /// session (replacing any previously installed ones).
    pub fn create_session(&self, connection: &ConnectionHandle) -> Result<SessionHandle> {
        if !connection.valid() {
            return Err(NetworkError::InvalidParameter(
                "invalid connection handle".into(),
            ));
        }

        let property_registry = self
            .inner
            .config
            .property_registry
            .clone()
            .unwrap_or_else(|| Arc::new(PropertyRegistry::new()));

        let machine = NetworkSession::new(
            connection.clone(),
            property_registry,
            self.inner.config.schema_registry.clone(),
            Arc::clone(&self.inner.policy),
            self.inner.config.batch,
        );
        let transport_state = machine.transport_state_cell();

        let (index, generation) = self
            .inner
            .pool
            .allocate(SessionSlot {
                connection: connection.clone(),
                machine,
            })
            .ok_or_else(|| {
                NetworkError::ResourceLimitExceeded(format!(
                    "session pool full ({} slots)",
                    self.inner.pool.capacity()
                ))
            })?;

        // Incoming frames route through the generation-validated slot, so
        // a frame racing destroy_session is dropped instead of touching a
        // recycled machine. Transport state flows into a lock-free cell the
        // machine reads on demand; no slot lock is taken on that path.
        let weak: Weak<SessionManagerInner> = Arc::downgrade(&self.inner);
        let wired = connection
            .set_message_callback(Arc::new(move |data: &[u8]| {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch_incoming(index, generation, data);
                }
            }))
            .and_then(|()| {
                connection.set_state_callback(Arc::new(move |state| {
                    transport_state.store(state.as_u8(), Ordering::Release);
                }))
            });
        if let Err(error) = wired {
            // The connection died under us; return the slot instead of
            // leaking it.
            let _ = self.inner.pool.free(index, generation);
            return Err(error);
        }

        Ok(SessionHandle::new(
            Arc::downgrade(&self.inner),
            index,
            generation,
        ))
    }

    /// Destroy a session and return its slot to the free list. The handle
    /// (and all copies) become invalid.
    pub fn destroy_session(&self, handle: &SessionHandle) -> Result<()> {
        self.check_owner(handle)?;
        let (index, generation) = handle.stamp();
        let _ = self.inner.pool.with_slot(index, generation, |slot| {
            slot.machine.begin_close();
            Ok(())
        });
        self.inner.pool.free(index, generation)
    }

    /// Whether `handle` addresses a live session of this manager.
    pub fn is_valid_handle(&self, handle: &SessionHandle) -> bool {
        self.check_owner(handle).is_ok() && handle.valid()
    }

    /// Number of active sessions.
    pub fn active_count(&self) -> usize {
        self.inner.pool.active_count()
    }

    /// Maximum number of sessions.
    pub fn capacity(&self) -> usize {
        self.inner.pool.capacity()
    }

    /// The schema registry this manager fans advertisements out for.
    pub fn schema_registry(&self) -> Option<Arc<SchemaRegistry>> {
        self.inner.config.schema_registry.clone()
    }

    /// Snapshot of the current NACK policy.
    pub fn nack_policy(&self) -> SchemaNackPolicy {
        self.inner.policy.load().as_ref().clone()
    }

    /// Replace the NACK policy; sessions observe the new value on their
    /// next unknown-schema event.
    pub fn set_nack_policy(&self, policy: SchemaNackPolicy) {
        self.inner.policy.store(Arc::new(policy));
    }

    /// Broadcast a schema advertisement to every handshake-complete
    /// session (best-effort, `try_lock` per slot).
    pub fn broadcast_schema_advertisement(&self, schema: &ComponentSchema) {
        self.inner.broadcast_advertisement(schema);
    }

    /// Broadcast a schema withdrawal to every handshake-complete session.
    pub fn broadcast_schema_unpublish(&self, type_hash: ComponentTypeHash) {
        self.inner.broadcast_unpublish(type_hash);
    }

    /// Flush property batches on every session that isn't busy. Useful for
    /// servers driving many sessions from one periodic task.
    pub fn flush_all_property_batches(&self) {
        self.inner.pool.try_for_each(|_, slot| {
            if let Err(error) = slot.machine.flush_property_updates() {
                log::debug!(
                    "batch flush for session {} failed: {}",
                    slot.machine.session_id(),
                    error
                );
            }
        });
    }

    fn check_owner(&self, handle: &SessionHandle) -> Result<()> {
        let owner = handle.owner().upgrade().ok_or_else(|| {
            NetworkError::InvalidParameter("invalid session handle".into())
        })?;
        if !Arc::ptr_eq(&owner, &self.inner) {
            return Err(NetworkError::InvalidParameter(
                "handle belongs to a different manager".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("capacity", &self.capacity())
            .field("active", &self.active_count())
            .finish()
    }
}
