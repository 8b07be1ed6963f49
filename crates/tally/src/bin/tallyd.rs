//! tallyd - line-protocol ingest daemon for tally timelines.
//!
//! Accepts `KEY COUNT TIME` records over TCP and stores them in per-key
//! timeline directories under the data directory.
//!
//! ## Configuration
//!
//! All configuration is done via environment variables:
//!
//! - `TALLY_ADDR`: listen address (default: 0.0.0.0:2003)
//! - `TALLY_DATA_DIR`: timeline root directory (default: ./tally-data)
//! - `TALLY_RESOLUTION`: time units per bucket (default: 10)
//! - `TALLY_SHARDS`: shard worker count (default: available parallelism)
//!
//! ## Logging
//!
//! Logging is controlled via the `RUST_LOG` environment variable:
//!
//! ```bash
//! RUST_LOG=debug tallyd    # detailed logs
//! RUST_LOG=info tallyd     # standard logs (default)
//! ```

use tally::server::{Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("TALLY_ADDR") {
        config = config.with_addr(addr);
    }
    if let Ok(dir) = std::env::var("TALLY_DATA_DIR") {
        config = config.with_data_dir(dir);
    }
    if let Ok(resolution) = std::env::var("TALLY_RESOLUTION") {
        config = config.with_resolution(resolution.parse()?);
    }
    if let Ok(shards) = std::env::var("TALLY_SHARDS") {
        config = config.with_shards(shards.parse()?);
    }

    let server = Server::bind(config).await?;
    server.run().await?;

    Ok(())
}
