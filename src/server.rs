//! TCP listener and accept loop.
//!
//! Accepts connections and spawns one session task per client, so a slow or
//! silent client never stalls the others. On shutdown the accept loop stops,
//! every open session is closed and joined, and only then is the listening
//! socket released.

use crate::config::Config;
use crate::registry::Registry;
use crate::session;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Server instance
pub struct Server {
    config: Config,
    registry: Arc<Registry>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config, registry: Arc<Registry>) -> Self {
        Server { config, registry }
    }

    /// Bind the listener and serve until the shutdown signal fires.
    ///
    /// A bind failure is fatal and is returned to the caller; once serving,
    /// per-connection errors never escape their session task.
    pub async fn run(&self, shutdown: watch::Receiver<()>) -> io::Result<()> {
        let addr: SocketAddr = self
            .config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let listener = bind_listener(addr)?;
        info!(addr = %addr, "Server listening");

        self.serve(listener, shutdown).await
    }

    async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<()>) -> io::Result<()> {
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                res = listener.accept() => match res {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "New connection");

                        let registry = Arc::clone(&self.registry);
                        let max_line = self.config.max_line_length;
                        let shutdown = shutdown.clone();

                        sessions.spawn(async move {
                            if let Err(e) =
                                session::run(stream, peer, registry, max_line, shutdown).await
                            {
                                debug!(peer = %peer, error = %e, "Session error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
                // Reap finished session tasks as they complete
                Some(_) = sessions.join_next() => {}
                _ = shutdown.changed() => break,
            }
        }

        // Stop accepting, close every client socket, then release the port
        let open = self.registry.drain();
        info!(sessions = open.len(), "Shutting down, closing open sessions");
        while sessions.join_next().await.is_some() {}
        drop(listener);

        Ok(())
    }
}

/// Create the listening socket.
///
/// `SO_REUSEADDR` lets the port rebind immediately after a clean shutdown.
fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    TcpListener::from_std(socket.into())
}
