// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport layer: the duplex links a connection slot owns.
//!
//! The backend set is closed, [`Local`](ConnectionType::Local) over a Unix
//! domain socket and [`Remote`](ConnectionType::Remote) over an externally
//! established peer-to-peer data channel, and is modeled as a tagged enum
//! with explicit match sites rather than virtual dispatch, keeping the wire
//! boundary inspectable.
//!
//! The transport contract: the message callback sees exactly the payload
//! the peer passed to the matching send; payloads are never split or
//! coalesced by the transport.

/// Unix-domain-socket transport.
pub mod local;
/// Wrapper over an external peer-to-peer data channel.
pub mod remote;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::error::Result;
use crate::core::types::{unix_millis, ConnectionState, ConnectionStats, ConnectionType};

pub use local::LocalTransport;
pub use remote::RemoteTransport;

/// Callback invoked with each received message payload.
pub type MessageCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Callback invoked on connection state changes.
pub type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Signaling outputs produced while a remote channel establishes.
///
/// The embedder shuttles these strings to the peer out-of-band (web socket
/// or any byte pipe) and feeds the peer's equivalents back through
/// [`DataChannel::set_remote_description`] / [`DataChannel::add_remote_candidate`].
pub struct SignalingCallbacks {
    /// Local session description is ready: `(type, sdp)`.
    pub on_local_description: Option<Arc<dyn Fn(&str, &str) + Send + Sync>>,
    /// Local candidate gathered: `(candidate, mid)`.
    pub on_local_candidate: Option<Arc<dyn Fn(&str, &str) + Send + Sync>>,
}

impl Default for SignalingCallbacks {
    fn default() -> Self {
        Self {
            on_local_description: None,
            on_local_candidate: None,
        }
    }
}

/// Contract consumed from the external peer-to-peer transport library.
///
/// An implementation adapts one established (or establishing) data-channel
/// pair: a reliable, ordered channel and an optional unreliable one.
///
/// Implementations MUST NOT report [`ConnectionState::Connected`] through
/// the state callback before the reliable channel is open; the peer
/// connection being up is not sufficient.
pub trait DataChannel: Send + Sync {
    /// Begin establishment. Completion is signaled via the state callback.
    fn connect(&self) -> Result<()>;

    /// Close both channels and the peer connection.
    fn disconnect(&self) -> Result<()>;

    /// Reliable, ordered send.
    fn send(&self, data: &[u8]) -> Result<()>;

    /// Non-blocking reliable send; `WouldBlock` when outgoing data is
    /// buffered above the implementation's threshold (0 is acceptable).
    fn try_send(&self, data: &[u8]) -> Result<()>;

    /// Best-effort unordered send. Implementations without a separate
    /// unreliable channel fall back to the reliable one.
    fn send_unreliable(&self, data: &[u8]) -> Result<()>;

    /// Install the receive callback. Invoked from the provider's threads
    /// with exactly one sent payload per call.
    fn set_message_callback(&self, callback: MessageCallback);

    /// Install the state-change callback.
    fn set_state_callback(&self, callback: StateCallback);

    /// Current state.
    fn state(&self) -> ConnectionState;

    /// Traffic counters.
    fn stats(&self) -> ConnectionStats;

    /// Apply the peer's session description received via signaling.
    fn set_remote_description(&self, sdp_type: &str, sdp: &str) -> Result<()>;

    /// Apply a peer candidate received via signaling.
    fn add_remote_candidate(&self, candidate: &str, mid: &str) -> Result<()>;
}

/// A connection slot's transport: one of the closed backend set.
pub enum Transport {
    /// Same-host Unix-socket link.
    Local(LocalTransport),
    /// Externally established peer-to-peer link.
    Remote(RemoteTransport),
}

impl Transport {
    /// Backend discriminator.
    pub fn transport_type(&self) -> ConnectionType {
        match self {
            Transport::Local(_) => ConnectionType::Local,
            Transport::Remote(_) => ConnectionType::Remote,
        }
    }

    pub fn connect(&self) -> Result<()> {
        match self {
            Transport::Local(t) => t.connect(),
            Transport::Remote(t) => t.connect(),
        }
    }

    pub fn disconnect(&self) -> Result<()> {
        match self {
            Transport::Local(t) => t.disconnect(),
            Transport::Remote(t) => t.disconnect(),
        }
    }

    pub fn send(&self, data: &[u8]) -> Result<()> {
        match self {
            Transport::Local(t) => t.send(data),
            Transport::Remote(t) => t.send(data),
        }
    }

    pub fn try_send(&self, data: &[u8]) -> Result<()> {
        match self {
            Transport::Local(t) => t.try_send(data),
            Transport::Remote(t) => t.try_send(data),
        }
    }

    pub fn send_unreliable(&self, data: &[u8]) -> Result<()> {
        match self {
            Transport::Local(t) => t.send_unreliable(data),
            Transport::Remote(t) => t.send_unreliable(data),
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self {
            Transport::Local(t) => t.state(),
            Transport::Remote(t) => t.state(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn stats(&self) -> ConnectionStats {
        match self {
            Transport::Local(t) => t.stats(),
            Transport::Remote(t) => t.stats(),
        }
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        match self {
            Transport::Local(t) => t.set_message_callback(callback),
            Transport::Remote(t) => t.set_message_callback(callback),
        }
    }

    pub fn set_state_callback(&self, callback: StateCallback) {
        match self {
            Transport::Local(t) => t.set_state_callback(callback),
            Transport::Remote(t) => t.set_state_callback(callback),
        }
    }
}

/// Monotone traffic counters, updated with relaxed atomics from transport
/// threads and snapshotted without locks.
#[derive(Default)]
pub(crate) struct TransportStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    connect_time_ms: AtomicU64,
    last_activity_ms: AtomicU64,
}

impl TransportStats {
    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.last_activity_ms.store(unix_millis(), Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.last_activity_ms.store(unix_millis(), Ordering::Relaxed);
    }

    pub fn record_connected(&self) {
        self.connect_time_ms.store(unix_millis(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            connect_time_ms: self.connect_time_ms.load(Ordering::Relaxed),
            last_activity_ms: self.last_activity_ms.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot_monotone() {
        let stats = TransportStats::default();
        stats.record_sent(10);
        stats.record_sent(5);
        stats.record_received(7);
        let snap = stats.snapshot();
        assert_eq!(snap.bytes_sent, 15);
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.bytes_received, 7);
        assert_eq!(snap.messages_received, 1);
        assert!(snap.last_activity_ms > 0);
    }
}
