// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Listeners: blocking `accept()` yielding adopted connection handles.
//!
//! Both acceptors share one shape: incoming transports are adopted into a
//! [`ConnectionManager`], a state callback enqueues the handle onto an
//! mpsc channel the moment the link reaches `Connected`, and `accept()`
//! blocks on that channel. `close()` drops the sender, so blocked callers
//! drain and then receive an invalid handle.
//!
//! [`LocalServer`] owns a Unix socket listener and an accept-loop thread.
//! [`RemoteServer`] owns no I/O at all: the embedder's signaling layer
//! constructs [`DataChannel`] adapters and feeds them to
//! [`RemoteServer::adopt`]; establishment then completes through the
//! out-of-band exchange.

use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::config::{LocalServerConfig, RemoteServerConfig};
use crate::connection::{ConnectionHandle, ConnectionManager};
use crate::core::error::{NetworkError, Result};
use crate::core::types::ConnectionState;
use crate::transport::{DataChannel, LocalTransport, Transport};

struct AcceptQueue {
    tx: Mutex<Option<Sender<ConnectionHandle>>>,
    rx: Receiver<ConnectionHandle>,
    running: AtomicBool,
}

impl AcceptQueue {
    fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
            running: AtomicBool::new(false),
        }
    }

    fn sender(&self) -> Option<Sender<ConnectionHandle>> {
        self.tx.lock().clone()
    }

    /// Block until a connection is ready or the queue closes.
    fn accept(&self) -> ConnectionHandle {
        match self.rx.recv() {
            Ok(handle) if self.running.load(Ordering::Acquire) => handle,
            _ => ConnectionHandle::invalid(),
        }
    }

    fn close(&self) {
        self.running.store(false, Ordering::Release);
        // Dropping the sender wakes every blocked accept() with Err.
        *self.tx.lock() = None;
    }
}

/// Wire a state callback that enqueues `handle` once it reaches
/// `Connected`. Shared by both acceptors.
fn enqueue_on_connected(handle: &ConnectionHandle, tx: Sender<ConnectionHandle>) -> Result<()> {
    let enqueued = handle.clone();
    let once = AtomicBool::new(false);
    handle.set_state_callback(Arc::new(move |state| {
        if state == ConnectionState::Connected && !once.swap(true, Ordering::AcqRel) {
            if tx.send(enqueued.clone()).is_err() {
                log::debug!("acceptor closed; connection {} not queued", enqueued);
            }
        }
    }))
}

/// Unix-socket listener adopting connections into a [`ConnectionManager`].
pub struct LocalServer {
    conn_mgr: ConnectionManager,
    endpoint: PathBuf,
    config: LocalServerConfig,
    queue: Arc<AcceptQueue>,
    accept_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl LocalServer {
    /// Create a server binding `endpoint` on `listen`.
    pub fn new(conn_mgr: &ConnectionManager, endpoint: impl Into<PathBuf>) -> Self {
        Self::with_config(conn_mgr, endpoint, LocalServerConfig::default())
    }

    /// Create a server with an explicit configuration.
    pub fn with_config(
        conn_mgr: &ConnectionManager,
        endpoint: impl Into<PathBuf>,
        config: LocalServerConfig,
    ) -> Self {
        Self {
            conn_mgr: conn_mgr.clone(),
            endpoint: endpoint.into(),
            config,
            queue: Arc::new(AcceptQueue::new()),
            accept_thread: Mutex::new(None),
        }
    }

    /// Bind the socket and start the accept loop.
    pub fn listen(&self) -> Result<()> {
        if self.queue.running.swap(true, Ordering::AcqRel) {
            return Err(NetworkError::AlreadyExists(
                "server is already listening".into(),
            ));
        }

        // A stale socket file from a crashed predecessor would fail the
        // bind; it is not a live endpoint, remove it.
        let _ = std::fs::remove_file(&self.endpoint);
        let listener = UnixListener::bind(&self.endpoint).map_err(|e| {
            self.queue.running.store(false, Ordering::Release);
            NetworkError::ConnectionClosed(format!(
                "bind {} failed: {}",
                self.endpoint.display(),
                e
            ))
        })?;
        listener.set_nonblocking(true).map_err(|e| {
            self.queue.running.store(false, Ordering::Release);
            NetworkError::ConnectionClosed(format!("set_nonblocking failed: {}", e))
        })?;

        let queue = Arc::clone(&self.queue);
        let conn_mgr = self.conn_mgr.clone();
        let poll_interval = Duration::from_millis(self.config.accept_poll_interval_ms.max(1));
        let endpoint = self.endpoint.clone();

        let handle = thread::Builder::new()
            .name("entsync-local-accept".into())
            .spawn(move || {
                log::info!("local server listening on {}", endpoint.display());
                while queue.running.load(Ordering::Acquire) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            if let Err(error) = Self::adopt_stream(&conn_mgr, &queue, stream) {
                                log::warn!("failed to adopt incoming connection: {}", error);
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            // Shutdown is polled rather than signaled.
                            thread::sleep(poll_interval);
                        }
                        Err(e) => {
                            log::error!("accept loop terminating: {}", e);
                            break;
                        }
                    }
                }
                let _ = std::fs::remove_file(&endpoint);
            })
            .map_err(|e| NetworkError::ConnectionClosed(format!("spawn failed: {}", e)))?;

        *self.accept_thread.lock() = Some(handle);
        Ok(())
    }

    fn adopt_stream(
        conn_mgr: &ConnectionManager,
        queue: &AcceptQueue,
        stream: std::os::unix::net::UnixStream,
    ) -> Result<()> {
        let tx = queue
            .sender()
            .ok_or_else(|| NetworkError::ConnectionClosed("acceptor closed".into()))?;
        let handle = conn_mgr.adopt(Transport::Local(LocalTransport::adopted(stream)))?;
        enqueue_on_connected(&handle, tx)?;
        // Starting I/O flips the adopted link to Connected, which enqueues.
        if let Err(error) = handle.connect() {
            let _ = handle.close();
            return Err(error);
        }
        Ok(())
    }

    /// Block until a connection completes establishment, or the server
    /// closes (invalid handle).
    pub fn accept(&self) -> ConnectionHandle {
        self.queue.accept()
    }

    /// Whether the server is accepting.
    pub fn is_listening(&self) -> bool {
        self.queue.running.load(Ordering::Acquire)
    }

    /// Stop listening; blocked `accept()` callers receive invalid handles.
    pub fn close(&self) -> Result<()> {
        if !self.queue.running.load(Ordering::Acquire) {
            return Ok(());
        }
        self.queue.close();
        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
        }
        log::info!("local server on {} closed", self.endpoint.display());
        Ok(())
    }
}

impl Drop for LocalServer {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Acceptor for externally signaled peer-to-peer channels.
pub struct RemoteServer {
    conn_mgr: ConnectionManager,
    config: RemoteServerConfig,
    queue: Arc<AcceptQueue>,
}

impl RemoteServer {
    /// Create a server adopting channels into `conn_mgr`.
    pub fn new(conn_mgr: &ConnectionManager, config: RemoteServerConfig) -> Self {
        Self {
            conn_mgr: conn_mgr.clone(),
            config,
            queue: Arc::new(AcceptQueue::new()),
        }
    }

    /// The configuration, for the embedder's signaling layer.
    pub fn config(&self) -> &RemoteServerConfig {
        &self.config
    }

    /// Begin accepting adopted channels.
    pub fn listen(&self) -> Result<()> {
        if self.queue.running.swap(true, Ordering::AcqRel) {
            return Err(NetworkError::AlreadyExists(
                "server is already listening".into(),
            ));
        }
        log::info!(
            "remote server accepting adopted channels (signaling port {})",
            self.config.port
        );
        Ok(())
    }

    /// Adopt a channel whose signaling the embedder is driving. The
    /// returned handle is also delivered through [`accept`](Self::accept)
    /// once the reliable channel opens.
    pub fn adopt(&self, channel: Box<dyn DataChannel>) -> Result<ConnectionHandle> {
        if !self.queue.running.load(Ordering::Acquire) {
            return Err(NetworkError::ConnectionClosed(
                "server is not listening".into(),
            ));
        }
        let tx = self
            .queue
            .sender()
            .ok_or_else(|| NetworkError::ConnectionClosed("acceptor closed".into()))?;
        let handle = self.conn_mgr.open_remote(channel)?;
        enqueue_on_connected(&handle, tx)?;
        if let Err(error) = handle.connect() {
            let _ = handle.close();
            return Err(error);
        }
        Ok(handle)
    }

    /// Block until an adopted channel completes establishment, or the
    /// server closes (invalid handle).
    pub fn accept(&self) -> ConnectionHandle {
        self.queue.accept()
    }

    /// Whether the server is accepting.
    pub fn is_listening(&self) -> bool {
        self.queue.running.load(Ordering::Acquire)
    }

    /// Stop accepting; blocked `accept()` callers receive invalid handles.
    pub fn close(&self) -> Result<()> {
        if !self.queue.running.load(Ordering::Acquire) {
            return Ok(());
        }
        self.queue.close();
        log::info!("remote server closed");
        Ok(())
    }
}

impl Drop for RemoteServer {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn socket_path(name: &str) -> PathBuf {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(name);
        std::mem::forget(dir);
        path
    }

    #[test]
    fn test_listen_twice_fails() {
        let mgr = ConnectionManager::new(4);
        let server = LocalServer::new(&mgr, socket_path("twice.sock"));
        server.listen().unwrap();
        assert!(matches!(
            server.listen(),
            Err(NetworkError::AlreadyExists(_))
        ));
        server.close().unwrap();
    }

    #[test]
    fn test_accept_returns_connected_handle() {
        let server_mgr = ConnectionManager::new(4);
        let client_mgr = ConnectionManager::new(4);
        let path = socket_path("accept.sock");

        let server = LocalServer::new(&server_mgr, &path);
        server.listen().unwrap();

        let client = client_mgr.open_local(&path).unwrap();
        client.connect().unwrap();

        let accepted = server.accept();
        assert!(accepted.valid());
        let deadline = Instant::now() + Duration::from_secs(2);
        while !accepted.is_connected() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(accepted.is_connected());
        assert_eq!(server_mgr.active_count(), 1);

        server.close().unwrap();
        client.close().unwrap();
    }

    #[test]
    fn test_close_unblocks_accept_with_invalid_handle() {
        let mgr = ConnectionManager::new(4);
        let server = Arc::new(LocalServer::new(&mgr, socket_path("unblock.sock")));
        server.listen().unwrap();

        let waiter = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.accept())
        };
        thread::sleep(Duration::from_millis(50));
        server.close().unwrap();

        let handle = waiter.join().expect("accept thread");
        assert!(!handle.valid());
        assert!(!server.is_listening());
    }

    #[test]
    fn test_remote_adopt_requires_listen() {
        use crate::transport::remote::testing::ChannelEnd;
        let mgr = ConnectionManager::new(4);
        let server = RemoteServer::new(&mgr, RemoteServerConfig::default());
        let (a, _b) = ChannelEnd::pair();
        assert!(matches!(
            server.adopt(Box::new(a)),
            Err(NetworkError::ConnectionClosed(_))
        ));
    }

    #[test]
    fn test_remote_adopt_queues_on_connect() {
        use crate::transport::remote::testing::ChannelEnd;
        let mgr = ConnectionManager::new(4);
        let server = RemoteServer::new(&mgr, RemoteServerConfig::default());
        server.listen().unwrap();

        let (a, _b) = ChannelEnd::pair();
        let adopted = server.adopt(Box::new(a)).unwrap();
        assert!(adopted.is_connected());

        let accepted = server.accept();
        assert_eq!(accepted, adopted);
        server.close().unwrap();
    }
}
