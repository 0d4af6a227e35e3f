//! Registry of active WebSocket connections.
//!
//! Entries live in a slab behind a mutex. The registry exists for
//! reporting only: nothing looks connections up or writes to them
//! through it.

use slab::Slab;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// What we remember about a connected client.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Remote address of the client.
    pub peer: SocketAddr,
    /// Request path from the upgrade request.
    pub path: String,
    /// When the handshake completed.
    pub connected_at: Instant,
}

impl ClientInfo {
    pub fn new(peer: SocketAddr, path: impl Into<String>) -> Self {
        Self {
            peer,
            path: path.into(),
            connected_at: Instant::now(),
        }
    }
}

/// Lock-guarded set of currently open connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    clients: Mutex<Slab<ClientInfo>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert a client and return the guard that removes it again.
    pub fn register(self: &Arc<Self>, info: ClientInfo) -> Registration {
        let connected_at = info.connected_at;
        let mut clients = self.lock();
        let key = clients.insert(info);
        let active = clients.len();
        drop(clients);

        Registration {
            registry: Arc::clone(self),
            key: Some(key),
            connected_at,
            active,
        }
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of every registered client.
    pub fn snapshot(&self) -> Vec<ClientInfo> {
        self.lock().iter().map(|(_, info)| info.clone()).collect()
    }

    /// Remove an entry, returning the count left behind.
    fn remove(&self, key: usize) -> usize {
        let mut clients = self.lock();
        clients.try_remove(key);
        clients.len()
    }

    // Poisoning is ignored; no holder leaves the slab half-updated.
    fn lock(&self) -> MutexGuard<'_, Slab<ClientInfo>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Membership of one connection in the registry.
///
/// Dropping it removes the entry, so every exit path of a connection
/// task (return, panic, abort) leaves the registry consistent.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    key: Option<usize>,
    connected_at: Instant,
    active: usize,
}

impl Registration {
    /// Active count right after this connection was inserted.
    pub fn active(&self) -> usize {
        self.active
    }

    /// How long the connection has been registered.
    pub fn elapsed(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Remove the entry and return the active count left behind.
    pub fn close(mut self) -> usize {
        self.release()
    }

    fn release(&mut self) -> usize {
        match self.key.take() {
            Some(key) => self.registry.remove(key),
            None => self.registry.len(),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.key.is_some() {
            self.release();
        }
    }
}
