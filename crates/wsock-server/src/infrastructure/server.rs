//! WebSocket server: accept loop, connect observers and the live connection set.
//!
//! # Lifecycle
//!
//! 1. [`Server::bind`] (or [`Server::start`]) resolves the listening address and
//!    binds a TCP listener.
//! 2. The accept loop hands every accepted socket to [`Connection::spawn_with_hooks`]
//!    and goes straight back to `accept()`.  It never waits for a handshake.
//! 3. When a connection completes its Upgrade handshake, *its own task* calls
//!    back into the server: the connection is inserted into the live set and
//!    every connect observer runs, before the first frame is decoded.  An
//!    observer that calls [`Connection::on_message`] therefore never misses a
//!    message.
//! 4. When the connection task ends, it removes itself from the live set.
//! 5. [`Server::shutdown`] clears the `running` flag and raises the shutdown
//!    signal.  The accept loop notices within 200 ms.  Every connection task
//!    subscribed to the signal when it was spawned, so connections still
//!    waiting for their handshake stop as well as upgraded ones.
//!
//! # Why `accept()` with a timeout?
//!
//! Without a timeout the loop would sit in `accept()` forever when no client
//! connects, and would never see the `running` flag change.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, field, info, info_span, Instrument, Span};

use crate::domain::{ConnectionId, ConnectionLimits, ServerConfig};
use crate::infrastructure::address::resolve_bind_address;
use crate::infrastructure::connection::{Connection, LifecycleHooks};

/// How often the accept loop re-checks the `running` flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Callback invoked once per connection after its handshake completes.
pub type ConnectObserver = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Errors that can occur while starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// No bind address was configured and no local IPv4 address was found.
    #[error("could not determine a local IPv4 address: {reason}")]
    AddressResolution { reason: String },

    /// The TCP listener could not be bound.
    #[error("failed to bind WebSocket listener on {addr}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

struct ServerShared {
    limits: ConnectionLimits,
    connect_observers: RwLock<Vec<ConnectObserver>>,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    running: Arc<AtomicBool>,
    /// Set to `true` once by `shutdown`; every connection task watches it.
    shutdown: watch::Sender<bool>,
    bound_addr: OnceLock<SocketAddr>,
    span: Span,
}

/// Handle to a running WebSocket server.
///
/// Cloning is cheap; all clones refer to the same listener and live set.
///
/// # Example
///
/// ```rust,no_run
/// use wsock_server::domain::ServerConfig;
/// use wsock_server::infrastructure::Server;
///
/// # async fn demo() -> Result<(), wsock_server::infrastructure::ServerError> {
/// let server = Server::bind(ServerConfig::with_address("127.0.0.1".parse().unwrap(), 0)).await?;
/// server.on_connect(|conn| {
///     let reply_to = conn.clone();
///     conn.on_message(move |text| {
///         let _ = reply_to.send(text);
///     });
/// });
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    fn new(limits: ConnectionLimits, parent: &Span) -> Self {
        let span = info_span!(parent: parent, "ws_server", addr = field::Empty);
        Self {
            shared: Arc::new(ServerShared {
                limits,
                connect_observers: RwLock::new(Vec::new()),
                connections: Mutex::new(HashMap::new()),
                running: Arc::new(AtomicBool::new(true)),
                shutdown: watch::Sender::new(false),
                bound_addr: OnceLock::new(),
                span,
            }),
        }
    }

    // ── Starting ──────────────────────────────────────────────────────────────

    /// Starts the server in the background and returns immediately.
    ///
    /// Binding happens on the accept task; a bind failure is logged at
    /// `error` level and the task exits.  Use [`bind`](Self::bind) to observe
    /// bind failures or the OS-assigned port.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`ServerError::AddressResolution`] if no bind address was configured
    /// and no local IPv4 address exists.
    pub fn start(config: ServerConfig) -> Result<Self, ServerError> {
        Self::start_in(config, &Span::current())
    }

    /// Like [`start`](Self::start), with the server span nested under `parent`.
    pub fn start_in(config: ServerConfig, parent: &Span) -> Result<Self, ServerError> {
        let addr = SocketAddr::new(resolve_bind_address(config.bind_address)?, config.port);
        let server = Self::new(config.limits, parent);

        let accept = server.clone();
        let span = server.shared.span.clone();
        tokio::spawn(
            async move {
                match TcpListener::bind(addr).await {
                    Ok(listener) => accept.accept_loop(listener).await,
                    Err(e) => error!("failed to bind WebSocket listener on {addr}: {e}"),
                }
            }
            .instrument(span),
        );

        Ok(server)
    }

    /// Binds the listener, spawns the accept loop, and returns once the
    /// server is accepting connections.
    ///
    /// # Errors
    ///
    /// - [`ServerError::AddressResolution`] as for [`start`](Self::start).
    /// - [`ServerError::BindFailed`] if the address is in use or not permitted.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        Self::bind_in(config, &Span::current()).await
    }

    /// Like [`bind`](Self::bind), with the server span nested under `parent`.
    pub async fn bind_in(config: ServerConfig, parent: &Span) -> Result<Self, ServerError> {
        let addr = SocketAddr::new(resolve_bind_address(config.bind_address)?, config.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::BindFailed { addr, source })?;

        let server = Self::new(config.limits, parent);
        let span = server.shared.span.clone();
        // Record the address before returning so `local_addr()` is immediately usable.
        server.record_bound_addr(&listener);

        let accept = server.clone();
        tokio::spawn(async move { accept.accept_loop(listener).await }.instrument(span));

        Ok(server)
    }

    fn record_bound_addr(&self, listener: &TcpListener) {
        match listener.local_addr() {
            Ok(addr) => {
                let _ = self.shared.bound_addr.set(addr);
                self.shared.span.record("addr", field::display(addr));
            }
            Err(e) => debug!("could not read listener address: {e}"),
        }
    }

    // ── Accept loop ───────────────────────────────────────────────────────────

    async fn accept_loop(self, listener: TcpListener) {
        self.record_bound_addr(&listener);
        match self.local_addr() {
            Some(addr) => info!("WebSocket server listening on {addr}"),
            None => info!("WebSocket server listening"),
        }

        loop {
            if !self.shared.running.load(Ordering::Acquire) {
                info!("shutdown flag set; stopping accept loop");
                break;
            }

            match timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
                Ok(Ok((stream, peer_addr))) => self.accept_connection(stream, peer_addr),
                // Transient accept error (e.g. too many open file descriptors).
                Ok(Err(e)) => error!("accept error: {e}"),
                // No new connection in the last interval.
                Err(_) => {}
            }
        }
    }

    fn accept_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        info!("new TCP connection from {peer_addr}");
        if let Err(e) = stream.set_nodelay(true) {
            debug!("failed to set TCP_NODELAY for {peer_addr}: {e}");
        }

        let on_upgrade = Arc::downgrade(&self.shared);
        let on_close = Arc::downgrade(&self.shared);
        let hooks = LifecycleHooks {
            on_upgrade: Some(Box::new(move |conn: &Connection| {
                if let Some(server) = upgrade(&on_upgrade) {
                    server.register(conn);
                }
            })),
            on_close: Some(Box::new(move |id| {
                if let Some(server) = upgrade(&on_close) {
                    server.unregister(id);
                }
            })),
            shutdown: Some(self.shared.shutdown.subscribe()),
        };

        Connection::spawn_with_hooks(
            stream,
            peer_addr,
            self.shared.limits,
            hooks,
            &self.shared.span,
        );
    }

    /// Adds an upgraded connection to the live set and notifies observers.
    fn register(&self, conn: &Connection) {
        if !self.is_running() {
            conn.stop();
            return;
        }

        self.shared
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn.id(), conn.clone());

        let observers: Vec<ConnectObserver> = self
            .shared
            .connect_observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        debug!(count = observers.len(), "notifying connect observers");
        for observer in &observers {
            observer(conn);
        }
    }

    fn unregister(&self, id: ConnectionId) {
        self.shared
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    // ── Public API ────────────────────────────────────────────────────────────

    /// Registers a connect observer.
    ///
    /// Observers run on the new connection's task, in registration order,
    /// after the handshake and before the first frame is dispatched.
    pub fn on_connect<F>(&self, callback: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.shared
            .connect_observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Snapshot of the currently upgraded connections.
    pub fn connections(&self) -> Vec<Connection> {
        self.shared
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Number of currently upgraded connections.
    pub fn connection_count(&self) -> usize {
        self.shared
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Queues `text` on every live connection.
    ///
    /// Returns the number of connections the message was queued on.
    pub fn broadcast(&self, text: &str) -> usize {
        let mut delivered = 0;
        for conn in self.connections() {
            match conn.send(text) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(conn_id = %conn.id(), "broadcast skipped connection: {e}"),
            }
        }
        delivered
    }

    /// Stops the accept loop and every connection task, including those
    /// still waiting for their handshake.
    pub fn shutdown(&self) {
        info!("shutting down WebSocket server");
        self.shared.running.store(false, Ordering::Release);
        self.shared.shutdown.send_replace(true);
    }

    /// Returns `false` once [`shutdown`](Self::shutdown) has been called.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// The address the listener is bound to, once binding has completed.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.bound_addr.get().copied()
    }
}

fn upgrade(weak: &Weak<ServerShared>) -> Option<Server> {
    weak.upgrade().map(|shared| Server { shared })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
