use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use crate::{error::SessionError, registry::Registry, router::Router, session};

/// Accepts TCP connections and runs one session task per connection.
pub struct Server {
    listener: TcpListener,
    router: Router,
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            router: Router::new(Arc::new(Registry::new())),
        }
    }

    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Ok(Self::new(listener))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(self.router.registry())
    }

    /// Accepts connections until the process is terminated.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, router } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&router).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &router);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(router: &Router) {
    info!("relay shutting down");
    router.broadcast_notice("Server shutting down", None).await;
    for session in router.registry().sessions() {
        session.close().await;
    }
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, router: &Router) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, router),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, router: &Router) {
    debug!(%peer, "accepted connection");
    let router = router.clone();
    tokio::spawn(async move {
        let (reader, writer) = stream.into_split();
        match session::serve(reader, writer, Some(peer), &router).await {
            Ok(()) => {}
            Err(SessionError::Handshake) => debug!(%peer, "closed connection without handshake"),
            Err(SessionError::DuplicateUsername(name)) => {
                info!(%peer, username = %name, "rejected duplicate username")
            }
            Err(SessionError::Io(err)) => {
                warn!(%peer, error = ?err, "client connection closed with error")
            }
        }
    });
}
