//! TCP listener for the relay server.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::{PeerchatError, Result};

/// Bound listening socket with a cap on concurrent peers.
pub struct RelayListener {
    listener: TcpListener,
    semaphore: Arc<Semaphore>,
}

impl RelayListener {
    /// Bind to `host:port` from the config.
    ///
    /// Fails with [`PeerchatError::Bind`] if the address is in use or not
    /// permitted.
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| PeerchatError::Bind {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;

        info!("Relay server listening on {}", local_addr);

        Ok(Self {
            listener,
            semaphore: Arc::new(Semaphore::new(config.max_connections.max(1))),
        })
    }

    /// Get the local address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept the next connection.
    ///
    /// Waits for a free slot first when the connection cap is reached. The
    /// slot is held until the returned permit is dropped.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit)> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PeerchatError::Io(std::io::Error::other("semaphore closed")))?;

        let (stream, addr) = self.listener.accept().await?;
        debug!("Accepted connection from {}", addr);

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }
}

/// An occupied connection slot, released on drop.
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}
