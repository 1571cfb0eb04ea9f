// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # entsync - Real-time entity/property synchronization networking
//!
//! A layered transport-and-session stack for synchronizing entity and
//! property state between peers over a single link carrying three traffic
//! classes: reliable, ordered control messages (entity lifecycle, schema
//! management), best-effort property-update batches for high-frequency
//! state, and reliable bulk scene snapshot transfers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use entsync::{ConnectionManager, Result, SessionManager};
//!
//! fn main() -> Result<()> {
//!     let connections = ConnectionManager::new(1024);
//!     let sessions = SessionManager::new(512);
//!
//!     // Connect and wrap the link in a protocol session.
//!     let conn = connections.open_local("/tmp/entsync.sock")?;
//!     conn.connect()?;
//!     let session = sessions.create_session(&conn)?;
//!
//!     // Handshake, then synchronize.
//!     session.perform_handshake("viewer", "client-1")?;
//!     session.send_entity_created(42, "demo", "Cube", 0)?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Application Layer                           |
//! |     ConnectionHandle / SessionHandle (generation-stamped)          |
//! +--------------------------------------------------------------------+
//! |                         Session Layer                              |
//! |  Handshake | Message Routing | Batching | Schema Fan-out | NACK    |
//! +--------------------------------------------------------------------+
//! |                        Protocol Layer                              |
//! |  Tagged Messages | Envelope Codec | Framing | Compression          |
//! +--------------------------------------------------------------------+
//! |                        Transport Layer                             |
//! |  Local (Unix socket, framed)  |  Remote (P2P data channels)        |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ConnectionManager`] | Slot pool of transports; issues connection handles |
//! | [`ConnectionHandle`] | Generation-stamped handle for link operations |
//! | [`SessionManager`] | Slot pool of protocol sessions; schema fan-out |
//! | [`SessionHandle`] | Generation-stamped handle for protocol operations |
//! | [`SchemaRegistry`] | Publish/unpublish schema store driving fan-out |
//! | [`PropertyRegistry`] | Entity/property store with hash resolution |
//!
//! ## Delivery classes
//!
//! | Message kind | Channel |
//! |---|---|
//! | Handshake, entity lifecycle, schema messages | Reliable, ordered |
//! | Property update batches | Unreliable, unordered |
//! | Scene snapshot chunks, heartbeats | Reliable |
//!
//! ## Concurrency model
//!
//! Parallel threads, no executor of its own. Every user-facing operation
//! is synchronous and returns a [`Result`]. Handles validate in O(1)
//! against generation-stamped slots; per-slot mutexes serialize operations
//! on one resource while the pools stay fully parallel. Callbacks are
//! invoked with the slot mutex held and must not re-enter the same
//! session.

/// Configuration structs for pools, batcher, and servers.
pub mod config;
/// Connection manager and handles.
pub mod connection;
/// Core building blocks (errors, types, slot pool, NACK, registry).
pub mod core;
/// Wire protocol (messages, framing, compression).
pub mod protocol;
/// Component schemas and the publish/unpublish registry.
pub mod schema;
/// Listeners yielding adopted connection handles.
pub mod server;
/// Session layer (machines, manager, handles, batcher).
pub mod session;
/// Transport layer (local Unix socket, remote data channels).
pub mod transport;

pub use config::{
    BatchConfig, ConnectionPoolConfig, LocalServerConfig, RemoteServerConfig, SessionPoolConfig,
};
pub use connection::{ConnectionHandle, ConnectionManager};
pub use core::{
    compute_component_type_hash, compute_property_hash, ComponentTypeHash, ConnectionState,
    ConnectionStats, ConnectionType, NackTrackerConfig, NetworkError, PropertyHash,
    PropertyRegistry, PropertyType, PropertyValue, Quat, Result, SchemaNackPolicy,
    SchemaNackTracker, Vec2, Vec3, Vec4,
};
pub use protocol::{Message, PropertyBatch, PropertyUpdate, SceneSnapshotChunk};
pub use schema::{ComponentSchema, PropertyMetadata, SchemaField, SchemaRegistry};
pub use server::{LocalServer, RemoteServer};
pub use session::{BatchStats, SessionHandle, SessionManager, SessionState};
pub use transport::{DataChannel, SignalingCallbacks};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
