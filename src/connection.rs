//! Connection session state and the registry of live connections.
//!
//! Each session tracks its current state (receiving, dispatching, closed)
//! and how many bets arrived since the last end-of-batch marker. The
//! registry maps live connections to their handler task and a duplicate
//! of their socket, so shutdown can force-close sockets and then await
//! the tasks.

use slab::Slab;
use std::net::{Shutdown, SocketAddr};
use tokio::task::JoinHandle;
use tracing::debug;

/// Current state of a connection's handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the next frame.
    Receiving,
    /// Processing the requests of one frame, in arrival order.
    Dispatching,
    /// Terminal.
    Closed,
}

/// Per-connection state, owned by its handler.
#[derive(Debug)]
pub struct Session {
    /// Registry key of this connection.
    pub id: usize,
    pub peer: SocketAddr,
    pub state: SessionState,
    /// Bets received since the last end-of-batch marker.
    pub batch_bets: usize,
    /// Set once this connection has asked for the draw.
    pub draw_requested: bool,
}

impl Session {
    /// Create a new session in initial receiving state.
    pub fn new(id: usize, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            state: SessionState::Receiving,
            batch_bets: 0,
            draw_requested: false,
        }
    }

    /// Transition to dispatching a received frame.
    pub fn start_dispatching(&mut self) {
        self.state = SessionState::Dispatching;
    }

    /// Transition back to receiving.
    pub fn start_receiving(&mut self) {
        self.state = SessionState::Receiving;
    }

    /// Mark the session closed.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Close the current batch, returning how many bets it held.
    pub fn finish_batch(&mut self) -> usize {
        std::mem::take(&mut self.batch_bets)
    }
}

/// A connection with a running handler.
#[derive(Debug)]
pub struct LiveConnection {
    pub peer: SocketAddr,
    /// Duplicate handle used to force-close the socket during shutdown.
    socket: socket2::Socket,
    task: JoinHandle<()>,
}

/// Registry of live connections using slab allocation.
///
/// Entries are inserted by the acceptor and removed exactly once: by the
/// handler on exit, or by [`ConnectionRegistry::close_all`] during shutdown.
pub struct ConnectionRegistry {
    connections: Slab<LiveConnection>,
    max_connections: usize,
    closed: bool,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
            closed: false,
        }
    }

    /// Register a connection, spawning its handler with the assigned key.
    ///
    /// The entry exists before the caller releases the registry, so a
    /// handler that finishes immediately still finds its own entry.
    /// Returns `None` (without spawning) when the registry is at capacity
    /// or already closed.
    pub fn register<F>(
        &mut self,
        peer: SocketAddr,
        socket: socket2::Socket,
        spawn: F,
    ) -> Option<usize>
    where
        F: FnOnce(usize) -> JoinHandle<()>,
    {
        if self.closed || self.connections.len() >= self.max_connections {
            return None;
        }
        let entry = self.connections.vacant_entry();
        let id = entry.key();
        let task = spawn(id);
        entry.insert(LiveConnection { peer, socket, task });
        Some(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<LiveConnection> {
        self.connections.try_remove(id)
    }

    /// Refuse new registrations, force-close every socket, and hand back
    /// the handler tasks so the caller can await them.
    pub fn close_all(&mut self) -> Vec<JoinHandle<()>> {
        self.closed = true;
        self.connections
            .drain()
            .map(|conn| {
                if let Err(e) = conn.socket.shutdown(Shutdown::Both) {
                    // Already gone on the peer's side
                    debug!(peer = %conn.peer, error = %e, "Socket shutdown failed");
                }
                conn.task
            })
            .collect()
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    fn duplicate(stream: &TcpStream) -> socket2::Socket {
        socket2::SockRef::from(stream).try_clone().unwrap()
    }

    #[test]
    fn test_session_state_transitions() {
        let mut session = Session::new(0, peer());
        assert_eq!(session.state, SessionState::Receiving);

        session.start_dispatching();
        assert_eq!(session.state, SessionState::Dispatching);

        session.start_receiving();
        assert_eq!(session.state, SessionState::Receiving);

        session.close();
        assert_eq!(session.state, SessionState::Closed);
    }

    #[test]
    fn test_finish_batch_resets_counter() {
        let mut session = Session::new(0, peer());
        session.batch_bets = 3;

        assert_eq!(session.finish_batch(), 3);
        assert_eq!(session.batch_bets, 0);
        assert_eq!(session.finish_batch(), 0);
    }

    #[tokio::test]
    async fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new(2);
        let (s1, _c1) = socket_pair().await;
        let (s2, _c2) = socket_pair().await;
        let (s3, _c3) = socket_pair().await;

        let id1 = registry
            .register(peer(), duplicate(&s1), |_| tokio::spawn(async {}))
            .unwrap();
        let id2 = registry
            .register(peer(), duplicate(&s2), |_| tokio::spawn(async {}))
            .unwrap();
        assert_ne!(id1, id2);

        // At capacity
        assert!(registry
            .register(peer(), duplicate(&s3), |_| tokio::spawn(async {}))
            .is_none());
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(id1).is_some());
        assert!(registry.remove(id1).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_close_all_shuts_sockets_and_refuses_new() {
        let mut registry = ConnectionRegistry::new(4);
        let (server, mut client) = socket_pair().await;

        let id = registry
            .register(peer(), duplicate(&server), |_| tokio::spawn(async {}))
            .unwrap();

        let tasks = registry.close_all();
        assert_eq!(tasks.len(), 1);
        assert!(registry.is_empty());
        assert!(registry.is_closed());
        assert!(registry.remove(id).is_none());

        // The peer observes end-of-stream
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);

        let (late, _late_client) = socket_pair().await;
        assert!(registry
            .register(peer(), duplicate(&late), |_| tokio::spawn(async {}))
            .is_none());

        for task in tasks {
            task.await.unwrap();
        }
        drop(server);
    }
}
