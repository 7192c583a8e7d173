//! HTTP server runner.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{routes::create_router, shutdown::shutdown_signal, state::AppState};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// Invalid listen address
    #[error("Invalid listen address '{0}'")]
    InvalidAddress(String),
    /// Bind or serve failure
    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Listener settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Grace period for in-flight requests after a shutdown signal
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Create with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the host
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the shutdown grace period
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    fn socket_addr(&self) -> Result<SocketAddr, ServerError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| ServerError::InvalidAddress(format!("{}:{}", self.host, self.port)))
    }
}

impl From<&pipeline_config::ServerConfig> for ServerConfig {
    fn from(config: &pipeline_config::ServerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

/// HTTP server
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    state: AppState,
}

impl Server {
    /// Create a server
    #[must_use]
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Serve until Ctrl+C or SIGTERM
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(async {
            shutdown_signal().await;
        })
        .await
    }

    /// Serve until `shutdown` resolves
    ///
    /// In-flight requests get `shutdown_timeout` to finish after the signal.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.config.socket_addr()?;
        let listener = TcpListener::bind(addr).await?;
        info!(address = %addr, "Pipeline server listening");

        let grace = self.config.shutdown_timeout;
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let signalled = async move {
            shutdown.await;
            let _ = stop_tx.send(());
        };

        let app = create_router(self.state);
        let serve = std::future::IntoFuture::into_future(
            axum::serve(listener, app).with_graceful_shutdown(signalled),
        );
        tokio::pin!(serve);

        tokio::select! {
            result = &mut serve => result?,
            () = async {
                // Start the grace timer only once shutdown began
                if stop_rx.await.is_ok() {
                    tokio::time::sleep(grace).await;
                } else {
                    std::future::pending::<()>().await;
                }
            } => {
                warn!(
                    grace_secs = grace.as_secs(),
                    "Grace period elapsed with requests still in flight"
                );
            }
        }

        info!("Pipeline server stopped");
        Ok(())
    }
}
