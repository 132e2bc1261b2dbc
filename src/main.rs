// # Resin server
//
// Entry point: load settings from the environment, bring the routing core
// up, and serve until interrupted.

use std::path::Path;
use std::sync::Arc;

use resin::geoip::{GeoReader, GeoReaderOpener};
use resin::node::DefaultOutboundFactory;
use resin::persist::MemoryStore;
use resin::{App, Settings, VERSION};
use tracing::{error, info};

/// Placeholder reader used until an mmdb parser is plugged in; every lookup
/// misses, so node regions stay empty.
struct NullGeoReader;

impl GeoReader for NullGeoReader {
    fn lookup(&self, _ip: std::net::IpAddr) -> Option<String> {
        None
    }
}

#[tokio::main]
async fn main() -> resin::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!(version = VERSION, "resin starting");

    let settings = Settings::from_env()?;
    for dir in [&settings.state_dir, &settings.cache_dir, &settings.log_dir] {
        if let Err(e) = std::fs::create_dir_all(dir) {
            error!(dir = %dir.display(), error = %e, "directory creation failed");
        }
    }

    let store = Arc::new(MemoryStore::new());
    let geo_opener: GeoReaderOpener =
        Arc::new(|_: &Path| Ok(Arc::new(NullGeoReader) as Arc<dyn GeoReader>));

    let app = App::build(
        settings,
        store,
        Arc::new(DefaultOutboundFactory),
        geo_opener,
    )
    .await?;
    app.start().await?;

    tokio::signal::ctrl_c().await.ok();
    app.shutdown().await;
    Ok(())
}
