// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wrapper over an externally established peer-to-peer data channel.
//!
//! The peer-to-peer library itself (data-channel establishment, ICE, SDP)
//! lives outside this crate; adapters implement [`DataChannel`] and hand
//! the pair in here. The wrapper owns the state machine the rest of the
//! stack sees (in particular, `Connected` is only entered through a legal
//! transition once the provider reports the reliable channel open) and
//! stamps uniform traffic stats on both directions.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{DataChannel, MessageCallback, StateCallback, TransportStats};
use crate::core::error::{NetworkError, Result};
use crate::core::types::{ConnectionState, ConnectionStats};

struct RemoteInner {
    channel: Box<dyn DataChannel>,
    state: AtomicU8,
    stats: TransportStats,
    message_cb: Mutex<Option<MessageCallback>>,
    state_cb: Mutex<Option<StateCallback>>,
}

impl RemoteInner {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn on_provider_state(&self, next: ConnectionState) {
        let mut current = self.state();
        loop {
            if current == next || !current.can_transition_to(next) {
                // Illegal provider transitions are dropped; the provider's
                // own "connected" signal is not trusted over our gating.
                if current != next {
                    log::debug!(
                        "remote transport: ignoring provider transition {} -> {}",
                        current,
                        next
                    );
                }
                return;
            }
            match self.state.compare_exchange(
                current.as_u8(),
                next.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = ConnectionState::from_u8(actual),
            }
        }
        if next == ConnectionState::Connected {
            self.stats.record_connected();
        }
        let callback = self.state_cb.lock().clone();
        if let Some(cb) = callback {
            cb(next);
        }
    }

    fn on_provider_message(&self, data: &[u8]) {
        self.stats.record_received(data.len());
        let callback = self.message_cb.lock().clone();
        if let Some(cb) = callback {
            cb(data);
        }
    }

    fn check_connected(&self) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(NetworkError::ConnectionClosed(
                "connection not established".into(),
            ));
        }
        Ok(())
    }
}

/// Transport over an external data-channel pair.
pub struct RemoteTransport {
    inner: Arc<RemoteInner>,
}

impl RemoteTransport {
    /// Wrap an adapter. The wrapper installs its own callbacks on the
    /// provider; consumers register theirs through the transport.
    pub fn new(channel: Box<dyn DataChannel>) -> Self {
        let inner = Arc::new(RemoteInner {
            channel,
            state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
            stats: TransportStats::default(),
            message_cb: Mutex::new(None),
            state_cb: Mutex::new(None),
        });

        // The provider holds callbacks that point back at the wrapper; the
        // references are weak so wrapper teardown is never kept alive by
        // the provider's threads.
        let weak: Weak<RemoteInner> = Arc::downgrade(&inner);
        inner.channel.set_state_callback(Arc::new(move |state| {
            if let Some(inner) = weak.upgrade() {
                inner.on_provider_state(state);
            }
        }));
        let weak: Weak<RemoteInner> = Arc::downgrade(&inner);
        inner.channel.set_message_callback(Arc::new(move |data| {
            if let Some(inner) = weak.upgrade() {
                inner.on_provider_message(data);
            }
        }));

        Self { inner }
    }

    pub fn connect(&self) -> Result<()> {
        if self.inner.state() != ConnectionState::Disconnected {
            return Err(NetworkError::InvalidParameter(
                "connection already active".into(),
            ));
        }
        self.inner.on_provider_state(ConnectionState::Connecting);
        self.inner.channel.connect()
    }

    pub fn disconnect(&self) -> Result<()> {
        if self.inner.state() == ConnectionState::Disconnected {
            return Ok(());
        }
        let result = self.inner.channel.disconnect();
        self.inner.on_provider_state(ConnectionState::Disconnected);
        result
    }

    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.inner.check_connected()?;
        self.inner.channel.send(data)?;
        self.inner.stats.record_sent(data.len());
        Ok(())
    }

    pub fn try_send(&self, data: &[u8]) -> Result<()> {
        self.inner.check_connected()?;
        self.inner.channel.try_send(data)?;
        self.inner.stats.record_sent(data.len());
        Ok(())
    }

    pub fn send_unreliable(&self, data: &[u8]) -> Result<()> {
        self.inner.check_connected()?;
        self.inner.channel.send_unreliable(data)?;
        self.inner.stats.record_sent(data.len());
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner.stats.snapshot()
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.inner.message_cb.lock() = Some(callback);
    }

    pub fn set_state_callback(&self, callback: StateCallback) {
        *self.inner.state_cb.lock() = Some(callback);
    }

    /// Feed the peer's session description from the signaling path.
    pub fn set_remote_description(&self, sdp_type: &str, sdp: &str) -> Result<()> {
        self.inner.channel.set_remote_description(sdp_type, sdp)
    }

    /// Feed a peer candidate from the signaling path.
    pub fn add_remote_candidate(&self, candidate: &str, mid: &str) -> Result<()> {
        self.inner.channel.add_remote_candidate(candidate, mid)
    }
}

impl Drop for RemoteTransport {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ChannelEnd;
    use super::*;

    #[test]
    fn test_connect_gates_on_provider_signal() {
        let (a, _b) = ChannelEnd::pair();
        let transport = RemoteTransport::new(Box::new(a));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(matches!(
            transport.send(b"early"),
            Err(NetworkError::ConnectionClosed(_))
        ));

        transport.connect().unwrap();
        assert_eq!(transport.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_send_paths_and_stats() {
        let (a, b) = ChannelEnd::pair();
        let ta = RemoteTransport::new(Box::new(a));
        let tb = RemoteTransport::new(Box::new(b));

        let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let received = Arc::clone(&received);
            tb.set_message_callback(Arc::new(move |data: &[u8]| {
                received.lock().push(data.to_vec());
            }));
        }

        ta.connect().unwrap();
        tb.connect().unwrap();

        ta.send(b"reliable").unwrap();
        ta.send_unreliable(b"besteffort").unwrap();
        assert_eq!(received.lock().len(), 2);

        let stats = ta.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.bytes_sent, 8 + 10);
        let stats = tb.stats();
        assert_eq!(stats.messages_received, 2);
    }

    #[test]
    fn test_unreliable_loss_is_silent() {
        let (a, b) = ChannelEnd::pair();
        a.set_unreliable_drop(true);
        let ta = RemoteTransport::new(Box::new(a));
        let _tb = RemoteTransport::new(Box::new(b));
        ta.connect().unwrap();
        // The send succeeds even though the payload is lost.
        ta.send_unreliable(b"gone").unwrap();
    }

    #[test]
    fn test_illegal_provider_transition_ignored() {
        let (a, _b) = ChannelEnd::pair();
        let transport = RemoteTransport::new(Box::new(a));
        // Provider claims Connected while we are still Disconnected (never
        // entered Connecting): not a legal transition, must be dropped.
        transport.inner.on_provider_state(ConnectionState::Connected);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }
}
