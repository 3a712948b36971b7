//! Unix socket listener for receiving handoffs from Apache.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ServerConfig;
use crate::error::{DaemonError, Result};
use crate::metrics;
use crate::shutdown::{ShutdownCoordinator, StreamGuard};

pub struct HandoffListener {
    listener: UnixListener,
    socket_path: PathBuf,
    permits: Arc<Semaphore>,
    shutdown: ShutdownCoordinator,
}

/// An accepted handoff connection, holding its concurrency permit.
pub struct AcceptedConnection {
    pub stream: UnixStream,
    /// Unregisters the stream when dropped.
    pub guard: StreamGuard,
    _permit: OwnedSemaphorePermit,
}

impl HandoffListener {
    /// Bind the handoff socket, replacing a stale one.
    pub async fn bind(config: &ServerConfig, shutdown: ShutdownCoordinator) -> Result<Self> {
        let socket_path = PathBuf::from(&config.socket_path);

        if socket_path.exists() {
            std::fs::remove_file(&socket_path).map_err(|e| {
                socket_error("Failed to remove stale socket", &socket_path, e)
            })?;
        }

        if let Some(parent) = socket_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| socket_error("Failed to create socket directory", parent, e))?;
            }
        }

        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| socket_error("Failed to bind socket", &socket_path, e))?;

        std::fs::set_permissions(
            &socket_path,
            std::fs::Permissions::from_mode(config.socket_mode),
        )
        .map_err(|e| socket_error("Failed to set socket permissions on", &socket_path, e))?;

        tracing::info!(
            socket_path = %socket_path.display(),
            max_connections = config.max_connections,
            "Handoff listener bound"
        );

        Ok(Self {
            listener,
            socket_path,
            permits: Arc::new(Semaphore::new(config.max_connections)),
            shutdown,
        })
    }

    /// Accept the next handoff connection.
    ///
    /// Waits for capacity when at the connection limit. Returns `None` once
    /// shutdown is signaled. Transient accept errors are logged and retried.
    pub async fn accept(&self) -> Option<AcceptedConnection> {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            if self.shutdown.is_shutdown() {
                return None;
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown_rx.wait_for(|down| *down) => return None,
                permit = self.permits.clone().acquire_owned() => permit.ok()?,
            };

            let accepted = tokio::select! {
                biased;
                _ = shutdown_rx.wait_for(|down| *down) => return None,
                result = self.listener.accept() => result,
            };

            match accepted {
                Ok((stream, _addr)) => {
                    metrics::record_connection_accepted();
                    return Some(AcceptedConnection {
                        stream,
                        guard: self.shutdown.register_stream(),
                        _permit: permit,
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "Accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Remaining connection capacity.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Drop for HandoffListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    error = %e,
                    path = %self.socket_path.display(),
                    "Failed to remove socket file"
                );
            }
        }
    }
}

fn socket_error(what: &str, path: &Path, e: std::io::Error) -> DaemonError {
    DaemonError::Socket(format!("{} {}: {}", what, path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_socket(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("sse-bridge-{}-{}.sock", name, std::process::id()))
            .display()
            .to_string()
    }

    #[tokio::test]
    async fn test_accept_and_shutdown() {
        let config = ServerConfig {
            socket_path: temp_socket("accept"),
            max_connections: 2,
            ..ServerConfig::default()
        };
        let shutdown = ShutdownCoordinator::new();
        let listener = HandoffListener::bind(&config, shutdown.clone()).await.unwrap();

        let _client = UnixStream::connect(listener.socket_path()).await.unwrap();
        let conn = listener.accept().await.expect("connection");
        assert_eq!(listener.available_permits(), 1);
        assert_eq!(shutdown.active_streams(), 1);

        drop(conn);
        assert_eq!(listener.available_permits(), 2);
        assert_eq!(shutdown.active_streams(), 0);

        shutdown.shutdown();
        assert!(listener.accept().await.is_none());

        let path = listener.socket_path().to_path_buf();
        drop(listener);
        assert!(!path.exists());
    }
}
