//! Server runtime: TLS acceptor loop, connection workers, signal handling,
//! graceful shutdown.

use crate::connection::{serve_connection, ServerContext};
use crate::error::ServerError;
use crate::registry::spawn_reaper;
use crate::tls;
use crate::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

/// Ceiling on a stalled TLS handshake
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long shutdown waits for connection tasks to drain
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Requests a running server to stop.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    /// Stop accepting, terminate sessions, and let `serve` return.
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

/// A bound, ready-to-serve FileHarbor server.
pub struct Server {
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Server {
    /// Validate the configuration, build the TLS acceptor, and bind the
    /// listener. Every failure here is a fatal startup error.
    ///
    /// # Errors
    ///
    /// Configuration, TLS material, or bind failures.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let tls_config = tls::server_tls_config(&config.security)?;
        let addr = config.bind_addr()?;
        let ctx = Arc::new(ServerContext::new(config)?);

        let listener = TcpListener::bind(addr).await?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            ctx,
            listener,
            acceptor: TlsAcceptor::from(tls_config),
            shutdown: Arc::new(shutdown),
        })
    }

    /// Actual bound address; useful with port 0.
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle to stop the server from elsewhere.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown))
    }

    /// Shared context (registry, libraries); exposed for tests and tooling.
    #[must_use]
    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    /// Accept and serve connections until the shutdown handle fires, then
    /// terminate sessions and drain workers.
    ///
    /// # Errors
    ///
    /// Listener failures that prevent accepting at all.
    pub async fn serve(self) -> Result<(), ServerError> {
        let addr = self.local_addr()?;
        tracing::info!(
            %addr,
            libraries = self.ctx.libraries.iter().count(),
            clients = self.ctx.authenticator.client_count(),
            "server listening"
        );

        let reaper = spawn_reaper(
            Arc::clone(&self.ctx.registry),
            reaper_interval(self.ctx.libraries.min_idle_timeout()),
        );

        let semaphore = Arc::new(Semaphore::new(self.ctx.config.network.max_connections));
        let mut workers = JoinSet::new();
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((tcp, peer)) => {
                        let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                            tracing::warn!(%peer, "connection limit reached, refusing");
                            drop(tcp);
                            continue;
                        };
                        let _ = tcp.set_nodelay(true);

                        let acceptor = self.acceptor.clone();
                        let ctx = Arc::clone(&self.ctx);
                        let shutdown = self.shutdown.subscribe();
                        workers.spawn(async move {
                            let _permit = permit;
                            match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(tcp))
                                .await
                            {
                                Ok(Ok(stream)) => {
                                    serve_connection(stream, peer, ctx, shutdown).await;
                                }
                                Ok(Err(err)) => {
                                    tracing::debug!(%peer, %err, "TLS accept failed");
                                }
                                Err(_) => {
                                    tracing::debug!(%peer, "TLS handshake timed out");
                                }
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!(%err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = workers.join_next(), if !workers.is_empty() => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        tracing::info!("shutting down: terminating sessions");
        reaper.abort();
        self.ctx.registry.shutdown().await;

        let drain = async {
            while workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_DRAIN, drain).await.is_err() {
            tracing::warn!("shutdown drain timed out, aborting remaining workers");
        }

        tracing::info!("server stopped");
        Ok(())
    }

    /// Serve until SIGINT/SIGTERM.
    ///
    /// # Errors
    ///
    /// As [`Server::serve`].
    pub async fn run_until_signal(self) -> Result<(), ServerError> {
        let handle = self.shutdown_handle();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("shutdown signal received");
            handle.shutdown();
        });
        self.serve().await
    }
}

/// Reaper pace: a fraction of the shortest idle timeout, clamped to stay
/// responsive without busy-scanning.
fn reaper_interval(min_idle: Duration) -> Duration {
    (min_idle / 4).clamp(Duration::from_secs(1), Duration::from_secs(30))
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            tracing::warn!(%err, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
