use std::sync::Arc;

use multiarcher::{AdmissionEngine, ClusterAccess, OciManifestInspector, Settings, cache, server};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(err) = run().await {
        error!(error = %err, "multiarcher failed");
        std::process::exit(1);
    }
}

async fn run() -> multiarcher::Result<()> {
    let settings = Settings::from_env()?;
    info!(
        platforms = ?settings.platforms.platforms().collect::<Vec<_>>(),
        addr = %settings.server.addr(),
        tls = settings.server.tls.is_some(),
        "loaded configuration"
    );

    let cache = cache::from_backend(&settings.cache)?;
    let cluster = ClusterAccess::connect().await;

    let engine = AdmissionEngine::new(
        Arc::new(settings.platforms),
        settings.namespaces,
        cluster,
        cache,
        Arc::new(OciManifestInspector::new()),
    );

    server::serve(Arc::new(engine), &settings.server).await
}
