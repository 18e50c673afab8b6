//! TCP server for agency connections.
//!
//! Accepts connections, spawns one handler task per connection, and
//! drives graceful shutdown: stop accepting, abort the draw barrier,
//! force-close every live socket, then wait for every handler.

use crate::barrier::DrawBarrier;
use crate::config::{Config, ConfigError};
use crate::connection::{ConnectionRegistry, Session};
use crate::handler;
use crate::ledger::Ledger;
use crate::shutdown::Shutdown;
use crate::storage::{BetStore, WinnerPredicate};
use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// State shared by the acceptor and every connection handler.
pub struct ServerContext {
    pub ledger: Arc<Ledger>,
    pub barrier: DrawBarrier,
    pub shutdown: Shutdown,
    pub max_frame_size: usize,
    registry: Mutex<ConnectionRegistry>,
    /// Agencies that already asked for the draw, on any connection
    draw_requests: Mutex<HashSet<u32>>,
}

impl ServerContext {
    pub fn new(config: &Config, store: Box<dyn BetStore>, is_winner: WinnerPredicate) -> Arc<Self> {
        Arc::new(Self {
            ledger: Ledger::new(store, is_winner),
            barrier: DrawBarrier::new(config.agencies, config.barrier_timeout),
            shutdown: Shutdown::new(),
            max_frame_size: config.max_frame_size,
            registry: Mutex::new(ConnectionRegistry::new(config.max_connections)),
            draw_requests: Mutex::new(HashSet::new()),
        })
    }

    pub fn registry(&self) -> MutexGuard<'_, ConnectionRegistry> {
        // Registry methods leave the slab consistent even if a caller panicked
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record that `agency` asked for the draw.
    ///
    /// Returns false if it already had, so each agency takes exactly one
    /// barrier slot no matter how many connections it opens.
    pub fn claim_draw(&self, agency: u32) -> bool {
        self.draw_requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(agency)
    }

    #[cfg(test)]
    pub fn draw_claimed(&self, agency: u32) -> bool {
        self.draw_requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&agency)
    }
}

/// Server instance
pub struct Server {
    config: Config,
    ctx: Arc<ServerContext>,
    /// Handler tasks drained from the registry and not yet joined
    draining: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config, store: Box<dyn BetStore>, is_winner: WinnerPredicate) -> Self {
        let ctx = ServerContext::new(&config, store, is_winner);
        Server {
            config,
            ctx,
            draining: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Bind the listening socket with the configured backlog.
    pub fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.config.listen_addr()?;
        let listener =
            create_listener(addr, self.config.listen_backlog).map_err(|source| ServerError::Bind {
                addr,
                source,
            })?;
        info!(address = %addr, backlog = self.config.listen_backlog, "Server listening");
        Ok(listener)
    }

    /// Bind, then serve until `signal` resolves.
    pub async fn run(&self, signal: impl Future<Output = ()>) -> Result<(), ServerError> {
        let listener = self.bind()?;
        self.serve(listener, signal).await;
        Ok(())
    }

    /// Accept connections until `signal` resolves or shutdown is triggered,
    /// then shut down gracefully.
    pub async fn serve(&self, listener: TcpListener, signal: impl Future<Output = ()>) {
        tokio::pin!(signal);
        let mut shutdown = self.ctx.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = shutdown.wait() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept_connection(stream, peer),
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
            }
        }

        // Stop accepting before tearing connections down
        drop(listener);
        self.shutdown().await;
    }

    fn accept_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let socket = match socket2::SockRef::from(&stream).try_clone() {
            Ok(socket) => socket,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to duplicate socket, dropping connection");
                return;
            }
        };

        let ctx = Arc::clone(&self.ctx);
        let mut registry = self.ctx.registry();
        let registered = registry.register(peer, socket, move |id| {
            tokio::spawn(handler::handle_connection(stream, Session::new(id, peer), ctx))
        });

        match registered {
            Some(id) => debug!(peer = %peer, id, live = registry.len(), "New connection"),
            None if registry.is_closed() => {
                debug!(peer = %peer, "Connection refused: shutting down");
            }
            None => warn!(peer = %peer, live = registry.len(), "Connection refused: server full"),
        }
    }

    /// Graceful shutdown. Safe to call more than once, also concurrently:
    /// every caller returns only once every handler has finished.
    pub async fn shutdown(&self) {
        if self.ctx.shutdown.trigger() {
            info!("Shutting down");
        }

        // Unblock handlers waiting for the draw, then those waiting for bytes
        self.ctx.barrier.abort();

        // Later callers queue here until the first one has joined everything
        let mut draining = self.draining.lock().await;
        {
            let mut registry = self.ctx.registry();
            if !registry.is_empty() {
                info!(connections = registry.len(), "Closing live connections");
            }
            draining.extend(registry.close_all());
        }

        // Pop only once joined, so a cancelled caller leaves the rest queued
        while let Some(task) = draining.last_mut() {
            if let Err(e) = task.await {
                error!(error = %e, "Connection handler panicked");
            }
            draining.pop();
        }
        info!("Shutdown complete");
    }

    /// Get a reference to the shared context for testing
    #[cfg(test)]
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }
}

/// Create a TCP listener with address reuse and the given accept backlog.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}
