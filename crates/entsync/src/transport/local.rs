// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Unix-domain-socket transport.
//!
//! Local links carry frames (see [`crate::protocol::framing`]) over a
//! `UnixStream`. Each connected transport runs two threads: a reader that
//! deframes the stream and drives the message callback, and a writer fed by
//! a bounded channel. The writer queue is also the backpressure signal:
//! `try_send` reports `WouldBlock` whenever outgoing frames are buffered.
//!
//! There is no separate unreliable channel on a Unix socket;
//! `send_unreliable` falls back to the reliable path.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{bounded, Sender, TrySendError};
use parking_lot::Mutex;

use super::{MessageCallback, StateCallback, TransportStats};
use crate::core::error::{NetworkError, Result};
use crate::core::types::{ConnectionState, ConnectionStats};
use crate::protocol::framing::{encode_frame, FrameAccumulator, DEFAULT_MAX_FRAME_SIZE};

/// Depth of the outgoing frame queue before `send` blocks.
const SEND_QUEUE_DEPTH: usize = 64;

/// Read buffer size for the deframing loop.
const READ_CHUNK: usize = 64 * 1024;

struct LocalIo {
    endpoint: PathBuf,
    state: AtomicU8,
    shutting_down: AtomicBool,
    stats: TransportStats,
    stream: Mutex<Option<UnixStream>>,
    writer_tx: Mutex<Option<Sender<Vec<u8>>>>,
    message_cb: Mutex<Option<MessageCallback>>,
    state_cb: Mutex<Option<StateCallback>>,
}

impl LocalIo {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transition to `next` if legal, firing the state callback. Returns
    /// whether the transition happened.
    fn set_state(&self, next: ConnectionState) -> bool {
        let mut current = self.state();
        loop {
            if current == next || !current.can_transition_to(next) {
                return false;
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
        true
    }

    fn deliver(&self, frame: &[u8]) {
        self.stats.record_received(frame.len());
        let callback = self.message_cb.lock().clone();
        if let Some(cb) = callback {
            cb(frame);
        }
    }

    /// Tear the link down from an I/O thread.
    fn fail_link(&self, state: ConnectionState) {
        if self.shutting_down.load(Ordering::Acquire) {
            return; // deliberate disconnect already in progress
        }
        *self.writer_tx.lock() = None;
        if let Some(stream) = self.stream.lock().take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.set_state(state);
    }
}

/// Transport over a Unix domain socket.
pub struct LocalTransport {
    io: Arc<LocalIo>,
    /// Stream adopted from a listener, installed before I/O starts.
    adopted: Mutex<Option<UnixStream>>,
}

impl LocalTransport {
    /// Outbound transport that will dial `endpoint` on `connect`.
    pub fn new(endpoint: impl Into<PathBuf>) -> Self {
        Self {
            io: Arc::new(LocalIo {
                endpoint: endpoint.into(),
                state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
                shutting_down: AtomicBool::new(false),
                stats: TransportStats::default(),
                stream: Mutex::new(None),
                writer_tx: Mutex::new(None),
                message_cb: Mutex::new(None),
                state_cb: Mutex::new(None),
            }),
            adopted: Mutex::new(None),
        }
    }

    /// Inbound transport adopting an accepted stream. I/O starts on
    /// `connect`, so the adopter can install callbacks first.
    pub fn adopted(stream: UnixStream) -> Self {
        let transport = Self::new(PathBuf::new());
        *transport.adopted.lock() = Some(stream);
        transport
    }

    pub fn connect(&self) -> Result<()> {
        if self.io.state() != ConnectionState::Disconnected {
            return Err(NetworkError::InvalidParameter(
                "connection already active".into(),
            ));
        }
        self.io.set_state(ConnectionState::Connecting);

        let stream = match self.adopted.lock().take() {
            Some(stream) => stream,
            None => match UnixStream::connect(&self.io.endpoint) {
                Ok(stream) => stream,
                Err(e) => {
                    self.io.set_state(ConnectionState::Failed);
                    return Err(NetworkError::ConnectionClosed(format!(
                        "connect to {} failed: {}",
                        self.io.endpoint.display(),
                        e
                    )));
                }
            },
        };

        self.start_io(stream)?;
        // The socket is the reliable channel; it is open now.
        self.io.set_state(ConnectionState::Connected);
        Ok(())
    }

    fn start_io(&self, stream: UnixStream) -> Result<()> {
        let write_half = stream.try_clone().map_err(|e| {
            NetworkError::ConnectionClosed(format!("stream clone failed: {}", e))
        })?;
        *self.io.stream.lock() = Some(
            stream
                .try_clone()
                .map_err(|e| NetworkError::ConnectionClosed(format!("stream clone failed: {}", e)))?,
        );

        let (tx, rx) = bounded::<Vec<u8>>(SEND_QUEUE_DEPTH);
        *self.io.writer_tx.lock() = Some(tx);

        let io = Arc::clone(&self.io);
        thread::Builder::new()
            .name("entsync-local-writer".into())
            .spawn(move || {
                let mut stream = write_half;
                for payload in rx.iter() {
                    let frame = encode_frame(&payload);
                    if let Err(e) = stream.write_all(&frame) {
                        log::debug!("local writer stopping: {}", e);
                        io.fail_link(ConnectionState::Disconnected);
                        break;
                    }
                }
            })
            .map_err(|e| NetworkError::ConnectionClosed(format!("spawn failed: {}", e)))?;

        let io = Arc::clone(&self.io);
        thread::Builder::new()
            .name("entsync-local-reader".into())
            .spawn(move || {
                let mut stream = stream;
                let mut accumulator = FrameAccumulator::new(DEFAULT_MAX_FRAME_SIZE);
                let mut buf = vec![0u8; READ_CHUNK];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) => {
                            io.fail_link(ConnectionState::Disconnected);
                            break;
                        }
                        Ok(n) => match accumulator.push(&buf[..n]) {
                            Ok(frames) => {
                                for frame in frames {
                                    io.deliver(&frame);
                                }
                            }
                            Err(e) => {
                                // Corrupt length prefix: no resync is
                                // possible, drop the link.
                                log::warn!("local reader protocol error: {}", e);
                                io.fail_link(ConnectionState::Disconnected);
                                break;
                            }
                        },
                        Err(e) => {
                            if !io.shutting_down.load(Ordering::Acquire) {
                                log::debug!("local reader stopping: {}", e);
                            }
                            io.fail_link(ConnectionState::Disconnected);
                            break;
                        }
                    }
                }
            })
            .map_err(|e| NetworkError::ConnectionClosed(format!("spawn failed: {}", e)))?;

        Ok(())
    }

    pub fn disconnect(&self) -> Result<()> {
        if self.io.state() == ConnectionState::Disconnected {
            return Ok(());
        }
        self.io.shutting_down.store(true, Ordering::Release);
        *self.io.writer_tx.lock() = None;
        if let Some(stream) = self.io.stream.lock().take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.io.set_state(ConnectionState::Disconnected);
        self.io.shutting_down.store(false, Ordering::Release);
        Ok(())
    }

    pub fn send(&self, data: &[u8]) -> Result<()> {
        if self.io.state() != ConnectionState::Connected {
            return Err(NetworkError::ConnectionClosed(
                "connection not established".into(),
            ));
        }
        let tx = self
            .io
            .writer_tx
            .lock()
            .clone()
            .ok_or_else(|| NetworkError::ConnectionClosed("writer stopped".into()))?;
        let len = data.len();
        tx.send(data.to_vec())
            .map_err(|_| NetworkError::ConnectionClosed("writer stopped".into()))?;
        self.io.stats.record_sent(len);
        Ok(())
    }

    pub fn try_send(&self, data: &[u8]) -> Result<()> {
        if self.io.state() != ConnectionState::Connected {
            return Err(NetworkError::ConnectionClosed(
                "connection not established".into(),
            ));
        }
        let tx = self
            .io
            .writer_tx
            .lock()
            .clone()
            .ok_or_else(|| NetworkError::ConnectionClosed("writer stopped".into()))?;
        // Anything already buffered counts as backpressure.
        if !tx.is_empty() {
            return Err(NetworkError::WouldBlock);
        }
        let len = data.len();
        match tx.try_send(data.to_vec()) {
            Ok(()) => {
                self.io.stats.record_sent(len);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(NetworkError::WouldBlock),
            Err(TrySendError::Disconnected(_)) => {
                Err(NetworkError::ConnectionClosed("writer stopped".into()))
            }
        }
    }

    /// No separate unreliable channel exists on a Unix socket; delivery
    /// falls back to the reliable path.
    pub fn send_unreliable(&self, data: &[u8]) -> Result<()> {
        self.send(data)
    }

    pub fn state(&self) -> ConnectionState {
        self.io.state()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.io.stats.snapshot()
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.io.message_cb.lock() = Some(callback);
    }

    pub fn set_state_callback(&self, callback: StateCallback) {
        *self.io.state_cb.lock() = Some(callback);
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::time::{Duration, Instant};

    fn socket_path(name: &str) -> PathBuf {
        let dir = tempfile::tempdir().expect("tempdir");
        // Keep the directory alive for the test's duration by leaking it;
        // the OS cleans tmp.
        let path = dir.path().join(name);
        std::mem::forget(dir);
        path
    }

    fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_connect_refused_fails() {
        let transport = LocalTransport::new("/nonexistent/entsync.sock");
        let err = transport.connect().unwrap_err();
        assert!(matches!(err, NetworkError::ConnectionClosed(_)));
        assert_eq!(transport.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_send_before_connect_fails() {
        let transport = LocalTransport::new("/tmp/entsync-unused.sock");
        assert!(matches!(
            transport.send(b"data"),
            Err(NetworkError::ConnectionClosed(_))
        ));
    }

    #[test]
    fn test_loopback_payload_fidelity() {
        let path = socket_path("loopback.sock");
        let listener = UnixListener::bind(&path).expect("bind");

        let accepted = thread::spawn(move || listener.accept().expect("accept").0);

        let client = LocalTransport::new(&path);
        let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let received = Arc::clone(&received);
            client.set_message_callback(Arc::new(move |data: &[u8]| {
                received.lock().push(data.to_vec());
            }));
        }
        client.connect().expect("connect");
        assert_eq!(client.state(), ConnectionState::Connected);

        let server = LocalTransport::adopted(accepted.join().expect("accept thread"));
        server.connect().expect("server start");

        // Server -> client: payloads arrive intact and unsplit.
        server.send(b"first").unwrap();
        server.send(b"second message").unwrap();
        assert!(wait_until(|| received.lock().len() == 2, Duration::from_secs(2)));
        let got = received.lock().clone();
        assert_eq!(got, vec![b"first".to_vec(), b"second message".to_vec()]);

        let stats = server.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.bytes_sent, 5 + 14);
        assert!(stats.connect_time_ms > 0);

        client.disconnect().unwrap();
        server.disconnect().unwrap();
    }

    #[test]
    fn test_peer_close_transitions_to_disconnected() {
        let path = socket_path("close.sock");
        let listener = UnixListener::bind(&path).expect("bind");
        let accepted = thread::spawn(move || listener.accept().expect("accept").0);

        let client = LocalTransport::new(&path);
        client.connect().expect("connect");
        let server_stream = accepted.join().unwrap();

        drop(server_stream); // peer goes away
        assert!(wait_until(
            || client.state() == ConnectionState::Disconnected,
            Duration::from_secs(2)
        ));
        assert!(matches!(
            client.send(b"late"),
            Err(NetworkError::ConnectionClosed(_))
        ));
    }

    #[test]
    fn test_unreliable_falls_back_to_reliable() {
        let path = socket_path("unreliable.sock");
        let listener = UnixListener::bind(&path).expect("bind");
        let accepted = thread::spawn(move || listener.accept().expect("accept").0);

        let client = LocalTransport::new(&path);
        client.connect().expect("connect");
        let server = LocalTransport::adopted(accepted.join().unwrap());
        let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let received = Arc::clone(&received);
            server.set_message_callback(Arc::new(move |data: &[u8]| {
                received.lock().push(data.to_vec());
            }));
        }
        server.connect().expect("server start");

        client.send_unreliable(b"best effort").unwrap();
        assert!(wait_until(|| !received.lock().is_empty(), Duration::from_secs(2)));
        assert_eq!(received.lock()[0], b"best effort");
    }
}
