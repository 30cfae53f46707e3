//! TCP server: one guest stream per connection.

use crate::config::DEFAULT_PORT;
use crate::error::HostError;
use crate::host::Host;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections. Connections beyond it are dropped.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            max_connections: 1000,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Serves a host to guests connecting over TCP.
pub struct Server {
    config: ServerConfig,
    host: Host,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    pub fn new(config: ServerConfig, host: Host) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            host,
            stats: Arc::new(ServerStats::default()),
            shutdown,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and serves until [`Server::shutdown`].
    pub async fn run(&self) -> Result<(), HostError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves connections accepted from `listener` until [`Server::shutdown`].
    /// Open connections are closed on shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), HostError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            addr = %listener.local_addr()?,
            readonly = self.host.is_readonly(),
            "Server listening"
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (tcp_stream, addr) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::error!(error = %e, "Accept error");
                            continue;
                        }
                    };

                    if self.stats.connections_active.load(Ordering::Relaxed)
                        >= self.config.max_connections as u64
                    {
                        tracing::warn!(%addr, "Connection limit reached, rejecting");
                        self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }

                    if let Err(e) = tcp_stream.set_nodelay(true) {
                        tracing::debug!(%addr, error = %e, "Failed to set TCP_NODELAY");
                    }

                    self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                    self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(%addr, "Guest connected");

                    let host = self.host.clone();
                    let stats = self.stats.clone();
                    let mut conn_shutdown = self.shutdown.subscribe();

                    tokio::spawn(async move {
                        let result = tokio::select! {
                            result = host.serve(tcp_stream) => result,
                            _ = conn_shutdown.recv() => Err(HostError::ShuttingDown),
                        };

                        match result {
                            Ok(()) | Err(HostError::ShuttingDown) => {}
                            Err(e) => {
                                tracing::debug!(%addr, error = %e, "Connection error");
                                stats.errors_total.fetch_add(1, Ordering::Relaxed);
                            }
                        }

                        stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                        tracing::info!(%addr, "Guest disconnected");
                    });
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stops accepting and closes open connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostOptions;
    use manykv_protocol::{Decoder, Encoder, Input, Output};
    use manykv_storage::MemoryStore;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn start(max_connections: usize) -> (Arc<Server>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let host = Host::new(Arc::new(MemoryStore::new()), HostOptions::new());
        let config = ServerConfig::new(addr).with_max_connections(max_connections);
        let server = Arc::new(Server::new(config, host));

        let running = server.clone();
        tokio::spawn(async move { running.serve(listener).await });
        (server, addr)
    }

    async fn roundtrip(stream: &mut TcpStream, input: Input) -> Output {
        stream
            .write_all(&Encoder::encode_input(&input).unwrap())
            .await
            .unwrap();

        let mut decoder = Decoder::new();
        let mut buf = [0u8; 1024];
        loop {
            if let Some(output) = decoder.decode_output().unwrap() {
                return output;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "server closed the connection");
            decoder.extend(&buf[..n]);
        }
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.max_connections, 1000);
    }

    #[tokio::test]
    async fn test_serves_over_tcp() {
        let (server, addr) = start(10).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let reply = roundtrip(
            &mut stream,
            Input::Put {
                id: 1,
                key: "a".into(),
                value: "1".into(),
            },
        )
        .await;
        assert_eq!(reply.id(), 1);

        let reply = roundtrip(&mut stream, Input::Get { id: 2, key: "a".into() }).await;
        assert_eq!(
            reply,
            Output::Callback {
                id: 2,
                error: None,
                value: Some("1".into())
            }
        );
        assert!(server.is_running());
        assert_eq!(server.stats().connections_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (server, addr) = start(10).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        roundtrip(&mut stream, Input::Get { id: 1, key: "a".into() }).await;

        server.shutdown();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let (server, addr) = start(1).await;
        let mut first = TcpStream::connect(addr).await.unwrap();
        roundtrip(&mut first, Input::Get { id: 1, key: "a".into() }).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(
            server.stats().connections_rejected.load(Ordering::Relaxed),
            1
        );
    }
}
