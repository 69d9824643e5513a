//! HTTP server that places the shaping middleware in front of an upstream.

use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{Result, ShaperError};
use crate::shaping::ShapingLayer;

/// HTTP server for the request shaper.
pub struct Server {
    /// Address to bind to
    addr: SocketAddr,
    /// The shaping middleware
    layer: ShapingLayer,
    /// Handlers served behind the middleware
    upstream: Router,
}

impl Server {
    /// Create a server that shapes traffic to the built-in upstream.
    pub fn new(addr: SocketAddr, layer: ShapingLayer) -> Self {
        Self::with_upstream(addr, layer, Router::new().fallback(upstream))
    }

    /// Create a server that shapes traffic to `upstream`.
    pub fn with_upstream(addr: SocketAddr, layer: ShapingLayer, upstream: Router) -> Self {
        Self {
            addr,
            layer,
            upstream,
        }
    }

    /// The upstream router wrapped in the shaping middleware.
    pub fn router(&self) -> Router {
        self.upstream.clone().layer(self.layer.clone())
    }

    /// Start the server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let app = self.router();

        // Reclaim idle buckets at the pace they expire
        let sweeper = self.layer.buckets().spawn_sweeper(self.layer.policy().ttl());

        info!(addr = %self.addr, "Starting request shaper");

        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            ShaperError::Io(e)
        });

        sweeper.abort();
        result
    }
}

/// Built-in upstream that acknowledges every request.
async fn upstream() -> &'static str {
    "OK"
}
