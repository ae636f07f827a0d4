//! TCP listener that spawns one [`Session`] per accepted sensor connection.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::{RwLock, watch};
use tracing::Instrument;

use crate::platform::{SocketConfig, configure_stream, create_listener};
use crate::session::{Session, SessionConfig, SessionContext};

/// Identifier the listener assigns to an admitted sensor connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Every sensor slot is taken.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("all {0} sensor slots are in use")]
pub struct ConnectionLimitReached(pub usize);

struct SensorPeer {
    addr: SocketAddr,
    admitted_at: Instant,
}

/// Admission control for sensor sessions.
///
/// Hands out at most `max_connections` slots. A session frees its slot with
/// [`ConnectionMap::release`] when it ends.
pub struct ConnectionMap {
    sessions: RwLock<HashMap<ConnectionId, SensorPeer>>,
    next_id: AtomicU64,
    max_connections: usize,
}

impl ConnectionMap {
    pub fn new(max_connections: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_connections,
        }
    }

    /// Admit the sensor at `addr`, or refuse it when no slot is free.
    pub async fn admit(&self, addr: SocketAddr) -> Result<ConnectionId, ConnectionLimitReached> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_connections {
            return Err(ConnectionLimitReached(self.max_connections));
        }
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        sessions.insert(
            id,
            SensorPeer {
                addr,
                admitted_at: Instant::now(),
            },
        );
        Ok(id)
    }

    /// Free the slot held by `id` and return how long the session lasted.
    pub async fn release(&self, id: ConnectionId) -> Option<Duration> {
        let peer = self.sessions.write().await.remove(&id)?;
        Some(peer.admitted_at.elapsed())
    }

    /// Addresses of the sensors currently holding a slot.
    pub async fn peers(&self) -> Vec<SocketAddr> {
        self.sessions.read().await.values().map(|peer| peer.addr).collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

/// Configuration for [`TelemetryServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to. Default: `0.0.0.0:5000`.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent sessions. Default: 64.
    pub max_connections: usize,
    /// Settings handed to every session.
    pub session: SessionConfig,
    /// Socket options.
    pub socket: SocketConfig,
    /// Pause after a failed `accept` so persistent errors (e.g. EMFILE) do
    /// not spin the loop. Default: 100 ms.
    pub accept_retry_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            max_connections: 64,
            session: SessionConfig::default(),
            socket: SocketConfig::default(),
            accept_retry_delay: Duration::from_millis(100),
        }
    }
}

/// Accepts sensor connections and runs a [`Session`] for each on its own task.
pub struct TelemetryServer {
    config: ServerConfig,
    context: Arc<SessionContext>,
    connections: Arc<ConnectionMap>,
    accepted: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl TelemetryServer {
    /// Create a server that persists into `context`.
    pub fn new(config: ServerConfig, context: SessionContext) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            connections: Arc::new(ConnectionMap::new(config.max_connections)),
            context: Arc::new(context),
            accepted: AtomicU64::new(0),
            config,
            shutdown_tx,
        }
    }

    /// Live session registry.
    pub fn connections(&self) -> &ConnectionMap {
        &self.connections
    }

    /// Number of connections admitted since the server started.
    pub fn accepted_count(&self) -> u64 {
        self.accepted.load(Ordering::Acquire)
    }

    /// Bind to the configured address and run the accept loop.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = create_listener(self.config.bind_addr, &self.config.socket)?;
        tracing::info!("Server listening on {}", self.config.bind_addr);
        self.run_with_listener(listener).await
    }

    /// Run the accept loop with a pre-bound listener (useful for tests).
    ///
    /// Returns once [`TelemetryServer::shutdown`] is called. Sessions that are
    /// already running are not interrupted.
    pub async fn run_with_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            // Transient accept errors must not stop the listener.
                            tracing::warn!("Accept failed: {e}");
                            tokio::time::sleep(self.config.accept_retry_delay).await;
                            continue;
                        }
                    };

                    let id = match self.connections.admit(peer_addr).await {
                        Ok(id) => id,
                        Err(e) => {
                            tracing::warn!("{e}, rejecting {peer_addr}");
                            continue;
                        }
                    };
                    self.accepted.fetch_add(1, Ordering::Release);
                    if let Err(e) = configure_stream(&stream, &self.config.socket) {
                        tracing::debug!("Could not set socket options for {peer_addr}: {e}");
                    }

                    tracing::info!("Accepted connection {id} from {peer_addr}");

                    let session = Session::new(stream, self.config.session.clone());
                    let context = Arc::clone(&self.context);
                    let connections = Arc::clone(&self.connections);
                    let span = tracing::info_span!("session", id = id.0, peer = %peer_addr);

                    tokio::spawn(
                        async move {
                            let result = session.run(&context).await;
                            let lasted = connections.release(id).await.unwrap_or_default();
                            match result {
                                Ok(()) => tracing::info!("Connection {id} closed after {lasted:?}"),
                                Err(e) => {
                                    tracing::warn!("Closing connection {id} after {lasted:?}: {e}")
                                }
                            }
                        }
                        .instrument(span),
                    );
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Server no longer accepting connections");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Stop accepting new connections.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratos_sink::FileSink;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    /// Helper: start a server on an ephemeral port and return the bound address.
    async fn start_test_server(
        max_connections: usize,
    ) -> (SocketAddr, Arc<TelemetryServer>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::create(dir.path()).await.unwrap();
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            max_connections,
            ..ServerConfig::default()
        };
        let server = Arc::new(TelemetryServer::new(config, SessionContext::new(sink)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let srv = Arc::clone(&server);
        tokio::spawn(async move {
            srv.run_with_listener(listener).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        (addr, server, dir)
    }

    #[tokio::test]
    async fn test_admitted_sensor_listed_by_peer_address() {
        let (addr, server, _dir) = start_test_server(16).await;
        let sensor = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let peers = server.connections().peers().await;
        assert_eq!(peers, vec![sensor.local_addr().unwrap()]);
    }

    #[tokio::test]
    async fn test_slots_freed_when_sensors_disconnect() {
        let (addr, server, _dir) = start_test_server(16).await;
        let mut sensors = Vec::new();
        for _ in 0..5 {
            sensors.push(TcpStream::connect(addr).await.unwrap());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.connections().len().await, 5);

        drop(sensors);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.connections().is_empty().await);
        assert_eq!(server.accepted_count(), 5);
    }

    #[tokio::test]
    async fn test_sensor_over_limit_is_dropped() {
        let (addr, server, _dir) = start_test_server(2).await;

        let _first = TcpStream::connect(addr).await.unwrap();
        let _second = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut third = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(1), third.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0, "a sensor over the limit should see its socket closed");
        assert_eq!(server.connections().len().await, 2);
        assert_eq!(server.accepted_count(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_keeps_existing_sessions() {
        let (addr, server, _dir) = start_test_server(16).await;
        let _existing = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(server.connections().len().await, 1);
        let late = tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await;
        assert!(
            !matches!(late, Ok(Ok(_))),
            "Listener should be closed after shutdown"
        );
    }

    #[tokio::test]
    async fn test_registry_reuses_freed_slots_with_fresh_ids() {
        let registry = ConnectionMap::new(2);
        let peer: SocketAddr = "10.0.0.7:40000".parse().unwrap();

        let first = registry.admit(peer).await.unwrap();
        let second = registry.admit(peer).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(
            registry.admit(peer).await.unwrap_err(),
            ConnectionLimitReached(2)
        );

        assert!(registry.release(first).await.is_some());
        assert!(registry.release(first).await.is_none());
        let third = registry.admit(peer).await.unwrap();
        assert_eq!(third, ConnectionId(3));
        assert_eq!(third.to_string(), "#3");
    }

    #[test]
    fn test_failed_accept_backs_off_by_default() {
        assert!(ServerConfig::default().accept_retry_delay >= Duration::from_millis(10));
    }
}
