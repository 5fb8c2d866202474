//! HTTP server assembly for the Manifold gateway
//!
//! Thin plumbing over the dispatch engine: the handlers parse the wire
//! request, invoke the dispatcher, and map errors to OpenAI-style JSON.

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use manifold_dispatch::{Dispatcher, ModelRegistry};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub use routes::WireChatRequest;

/// Assembled server with all routes and middleware
pub struct Server {
    router: Router,
    listen_address: SocketAddr,
}

impl Server {
    /// Build the server around a constructed registry
    pub fn new(registry: Arc<ModelRegistry>, listen_address: SocketAddr) -> Self {
        let dispatcher = Dispatcher::new(registry);
        let router = routes::api_router(dispatcher).layer(TraceLayer::new_for_http());

        Self {
            router,
            listen_address,
        }
    }

    /// The assembled router, for embedding in tests
    pub fn into_router(self) -> Router {
        self.router
    }

    /// Bind and serve until the shutdown token fires, then drain
    /// in-flight requests
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind or the server loop
    /// fails.
    pub async fn serve(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.listen_address).await?;
        tracing::info!(address = %self.listen_address, "listening");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                tracing::info!("draining in-flight requests");
            })
            .await?;

        Ok(())
    }
}
