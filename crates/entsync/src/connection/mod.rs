// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection manager and generation-stamped connection handles.
//!
//! The manager owns every transport in a fixed slot pool and hands out
//! [`ConnectionHandle`] values stamped with `(owner, index, generation)`.
//! Handles are freely copyable identity values: copies address the same
//! slot, the manager keeps ownership, and a freed slot invalidates every
//! outstanding handle for it in O(1).

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use crate::config::ConnectionPoolConfig;
use crate::core::error::{NetworkError, Result};
use crate::core::slot::SlotPool;
use crate::core::types::{ConnectionState, ConnectionStats, ConnectionType};
use crate::transport::{
    DataChannel, LocalTransport, MessageCallback, RemoteTransport, StateCallback, Transport,
};

pub(crate) struct ConnectionManagerInner {
    pool: SlotPool<Transport>,
}

/// Slot-pool owner of transports; issues [`ConnectionHandle`]s.
///
/// Cloning a manager clones a reference to the same pool, so servers and
/// session managers can each hold one without ownership games.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnectionManagerInner>,
}

impl ConnectionManager {
    /// Create a manager with `capacity` connection slots.
    pub fn new(capacity: usize) -> Self {
        Self::with_config(ConnectionPoolConfig { capacity })
    }

    /// Create a manager from a configuration struct.
    pub fn with_config(config: ConnectionPoolConfig) -> Self {
        Self {
            inner: Arc::new(ConnectionManagerInner {
                pool: SlotPool::new(config.capacity),
            }),
        }
    }

    /// Open a local (Unix socket) connection slot targeting `endpoint`.
    /// The link is dialed by [`ConnectionHandle::connect`].
    pub fn open_local(&self, endpoint: impl Into<PathBuf>) -> Result<ConnectionHandle> {
        self.install(Transport::Local(LocalTransport::new(endpoint)))
    }

    /// Open a remote connection slot around an external data-channel
    /// adapter. Establishment is driven by [`ConnectionHandle::connect`]
    /// and the embedder's signaling exchange.
    pub fn open_remote(&self, channel: Box<dyn DataChannel>) -> Result<ConnectionHandle> {
        self.install(Transport::Remote(RemoteTransport::new(channel)))
    }

    /// Adopt an already constructed transport (listener side).
    pub(crate) fn adopt(&self, transport: Transport) -> Result<ConnectionHandle> {
        self.install(transport)
    }

    fn install(&self, transport: Transport) -> Result<ConnectionHandle> {
        let (index, generation) = self.inner.pool.allocate(transport).ok_or_else(|| {
            NetworkError::ResourceLimitExceeded(format!(
                "connection pool full ({} slots)",
                self.inner.pool.capacity()
            ))
        })?;
        Ok(ConnectionHandle {
            owner: Arc::downgrade(&self.inner),
            index,
            generation,
        })
    }

    /// Close a connection and free its slot. The handle (and all copies)
    /// become invalid.
    pub fn close(&self, handle: &ConnectionHandle) -> Result<()> {
        self.check_owner(handle)?;
        self.inner.pool.free(handle.index, handle.generation)
    }

    /// Number of currently allocated connections.
    pub fn active_count(&self) -> usize {
        self.inner.pool.active_count()
    }

    /// Maximum number of connections.
    pub fn capacity(&self) -> usize {
        self.inner.pool.capacity()
    }

    fn check_owner(&self, handle: &ConnectionHandle) -> Result<()> {
        let owner = handle
            .owner
            .upgrade()
            .ok_or_else(|| NetworkError::InvalidParameter("invalid connection handle".into()))?;
        if !Arc::ptr_eq(&owner, &self.inner) {
            return Err(NetworkError::InvalidParameter(
                "handle belongs to a different manager".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("capacity", &self.capacity())
            .field("active", &self.active_count())
            .finish()
    }
}

/// Generation-stamped handle to a connection slot.
///
/// The primary API for connection operations. Every call re-validates the
/// stamp and then holds the slot's mutex for the duration of the call, so
/// per-slot operations serialize while the pool stays parallel.
#[derive(Clone, Default)]
pub struct ConnectionHandle {
    pub(crate) owner: Weak<ConnectionManagerInner>,
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ConnectionHandle {
    /// An invalid handle (no stamped identity).
    pub fn invalid() -> Self {
        Self::default()
    }

    /// Whether this handle still refers to a live connection: the owner
    /// exists, the index is in range, and the slot generation matches.
    pub fn valid(&self) -> bool {
        self.owner
            .upgrade()
            .is_some_and(|owner| owner.pool.is_valid(self.index, self.generation))
    }

    fn with_transport<R>(&self, f: impl FnOnce(&Transport) -> Result<R>) -> Result<R> {
        let owner = self
            .owner
            .upgrade()
            .ok_or_else(|| NetworkError::InvalidParameter("invalid connection handle".into()))?;
        owner
            .pool
            .with_slot(self.index, self.generation, |transport| f(transport))
    }

    /// Initiate connection to the endpoint. Transitions Disconnected ->
    /// Connecting; Connected is signaled through the state callback once
    /// the reliable channel is open.
    pub fn connect(&self) -> Result<()> {
        self.with_transport(|t| t.connect())
    }

    /// Gracefully close the link. Does not free the slot; use
    /// [`close`](Self::close) for that.
    pub fn disconnect(&self) -> Result<()> {
        self.with_transport(|t| t.disconnect())
    }

    /// Disconnect and free the slot. After this returns, `valid()` is false
    /// for every copy of the handle.
    pub fn close(&self) -> Result<()> {
        let owner = self
            .owner
            .upgrade()
            .ok_or_else(|| NetworkError::InvalidParameter("invalid connection handle".into()))?;
        owner.pool.free(self.index, self.generation)
    }

    /// Reliable, ordered send.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.with_transport(|t| t.send(data))
    }

    /// Non-blocking send; `WouldBlock` when the transport reports
    /// backpressure.
    pub fn try_send(&self, data: &[u8]) -> Result<()> {
        self.with_transport(|t| t.try_send(data))
    }

    /// Best-effort send on the unreliable channel, falling back to the
    /// reliable one where the backend has no separate channel.
    pub fn send_unreliable(&self, data: &[u8]) -> Result<()> {
        self.with_transport(|t| t.send_unreliable(data))
    }

    /// Whether the connection is established and ready.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current connection state (`Disconnected` for invalid handles).
    pub fn state(&self) -> ConnectionState {
        self.with_transport(|t| Ok(t.state()))
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Connection statistics (zeroed for invalid handles).
    pub fn stats(&self) -> ConnectionStats {
        self.with_transport(|t| Ok(t.stats())).unwrap_or_default()
    }

    /// Backend type of this connection.
    pub fn transport_type(&self) -> Result<ConnectionType> {
        self.with_transport(|t| Ok(t.transport_type()))
    }

    /// Install the receive callback for this connection.
    pub fn set_message_callback(&self, callback: MessageCallback) -> Result<()> {
        self.with_transport(|t| {
            t.set_message_callback(callback);
            Ok(())
        })
    }

    /// Install the state-change callback for this connection.
    pub fn set_state_callback(&self, callback: StateCallback) -> Result<()> {
        self.with_transport(|t| {
            t.set_state_callback(callback);
            Ok(())
        })
    }

    /// Feed the peer's session description to a remote transport.
    pub fn set_remote_description(&self, sdp_type: &str, sdp: &str) -> Result<()> {
        self.with_transport(|t| match t {
            Transport::Remote(remote) => remote.set_remote_description(sdp_type, sdp),
            Transport::Local(_) => Err(NetworkError::InvalidParameter(
                "local connections carry no signaling".into(),
            )),
        })
    }

    /// Feed a peer candidate to a remote transport.
    pub fn add_remote_candidate(&self, candidate: &str, mid: &str) -> Result<()> {
        self.with_transport(|t| match t {
            Transport::Remote(remote) => remote.add_remote_candidate(candidate, mid),
            Transport::Local(_) => Err(NetworkError::InvalidParameter(
                "local connections carry no signaling".into(),
            )),
        })
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.owner, &other.owner)
            && self.index == other.index
            && self.generation == other.generation
    }
}

impl Eq for ConnectionHandle {}

impl Hash for ConnectionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Weak::as_ptr(&self.owner) as usize).hash(state);
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.owner.upgrade().is_none() {
            write!(f, "ConnectionHandle(invalid)")
        } else {
            write!(
                f,
                "ConnectionHandle(index={}, gen={})",
                self.index, self.generation
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhaustion() {
        let manager = ConnectionManager::new(2);
        let _h1 = manager.open_local("/tmp/a.sock").unwrap();
        let _h2 = manager.open_local("/tmp/b.sock").unwrap();
        let err = manager.open_local("/tmp/c.sock").unwrap_err();
        assert!(matches!(err, NetworkError::ResourceLimitExceeded(_)));
        assert_eq!(manager.active_count(), 2);
    }

    #[test]
    fn test_close_invalidates_and_recycles() {
        let manager = ConnectionManager::new(1);
        let h1 = manager.open_local("/tmp/a.sock").unwrap();
        assert!(h1.valid());
        h1.close().unwrap();
        assert!(!h1.valid());
        assert_eq!(manager.active_count(), 0);

        let h2 = manager.open_local("/tmp/b.sock").unwrap();
        assert!(h2.valid());
        assert!(!h1.valid());
        assert_eq!(h2.index, h1.index);
        assert_ne!(h2.generation, h1.generation);

        // Stale handle operations fail with InvalidParameter.
        assert!(matches!(
            h1.send(b"stale"),
            Err(NetworkError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_handle_identity() {
        let manager = ConnectionManager::new(2);
        let h1 = manager.open_local("/tmp/a.sock").unwrap();
        let copy = h1.clone();
        assert_eq!(h1, copy);

        let h2 = manager.open_local("/tmp/b.sock").unwrap();
        assert_ne!(h1, h2);

        let mut set = std::collections::HashSet::new();
        set.insert(h1.clone());
        set.insert(copy);
        set.insert(h2);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_default_handle_invalid() {
        let handle = ConnectionHandle::invalid();
        assert!(!handle.valid());
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert_eq!(handle.stats(), ConnectionStats::default());
        assert_eq!(format!("{}", handle), "ConnectionHandle(invalid)");
        assert!(handle.connect().is_err());
    }

    #[test]
    fn test_manager_drop_invalidates_handles() {
        let manager = ConnectionManager::new(2);
        let handle = manager.open_local("/tmp/a.sock").unwrap();
        drop(manager);
        assert!(!handle.valid());
        assert!(matches!(
            handle.send(b"x"),
            Err(NetworkError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_cross_manager_handles_rejected() {
        let a = ConnectionManager::new(2);
        let b = ConnectionManager::new(2);
        let handle = a.open_local("/tmp/a.sock").unwrap();
        assert!(matches!(
            b.close(&handle),
            Err(NetworkError::InvalidParameter(_))
        ));
        a.close(&handle).unwrap();
    }

    #[test]
    fn test_signaling_rejected_on_local() {
        let manager = ConnectionManager::new(1);
        let handle = manager.open_local("/tmp/a.sock").unwrap();
        assert!(matches!(
            handle.set_remote_description("offer", "sdp"),
            Err(NetworkError::InvalidParameter(_))
        ));
    }
}
