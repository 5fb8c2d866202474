use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// OpenAI-compatible gateway that fans requests across upstream fleets
#[derive(Debug, Parser)]
#[command(name = "manifold", version, about)]
pub struct Args {
    /// Path to the YAML configuration file
    #[arg(long, short, env = "MANIFOLD_CONFIG", default_value = "config/config.yaml")]
    pub config: PathBuf,

    /// Address to listen on
    #[arg(long, env = "MANIFOLD_LISTEN", default_value = "0.0.0.0:8000")]
    pub listen: SocketAddr,

    /// Path of the durable metrics snapshot
    #[arg(long, env = "MANIFOLD_METRICS_PATH", default_value = "metrics/provider_metrics.json")]
    pub metrics_path: PathBuf,

    /// Seconds between periodic metrics flushes
    #[arg(long, default_value_t = 60)]
    pub metrics_flush_seconds: u64,
}
