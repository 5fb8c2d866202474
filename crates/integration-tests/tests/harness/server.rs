//! Test server wrapper that runs the gateway on a random port

use std::net::SocketAddr;
use std::sync::Arc;

use manifold_config::Config;
use manifold_dispatch::{ModelRegistry, SystemClock};
use manifold_server::Server;
use manifold_translate::TranslatorRegistry;
use tokio_util::sync::CancellationToken;

/// A running gateway instance backed by a temp metrics directory
pub struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    client: reqwest::Client,
    _metrics_dir: tempfile::TempDir,
}

impl TestServer {
    /// Parse the YAML config, build the registry, and serve on port 0
    pub async fn start(config_yaml: &str) -> anyhow::Result<Self> {
        let config = Config::parse(config_yaml)?;
        let metrics_dir = tempfile::tempdir()?;

        let translators = TranslatorRegistry::with_defaults();
        let registry = Arc::new(ModelRegistry::build(
            &config,
            &translators,
            SystemClock::shared(),
            metrics_dir.path().join("provider_metrics.json"),
        )?);
        registry.load_metrics();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();

        let router = Server::new(registry, addr).into_router();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_clone.cancelled().await;
                })
                .await
                .ok();
        });

        Ok(Self {
            addr,
            shutdown,
            client: reqwest::Client::new(),
            _metrics_dir: metrics_dir,
        })
    }

    /// Full URL for a path on the running server
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
