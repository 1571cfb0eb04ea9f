// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session layer: protocol machines, their slot manager, handles, and the
//! property-update batcher.

/// Property-update batcher.
pub mod batch;
/// Session handles.
pub mod handle;
/// Per-link protocol state machine.
pub mod machine;
/// Session slot manager.
pub mod manager;

pub use batch::{BatchManager, BatchSink, BatchStats};
pub use handle::SessionHandle;
pub use machine::{
    EntityCreatedCallback, EntityDestroyedCallback, ErrorCallback, HandshakeCallback,
    HeartbeatCallback, NetworkSession, PropertyUpdateCallback, SceneSnapshotCallback,
    SchemaAdvertisementCallback, SchemaNackCallback, SessionState, PROTOCOL_VERSION,
};
pub use manager::SessionManager;
