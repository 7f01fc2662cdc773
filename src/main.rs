use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use water_usage_service::{build_router, server, ChromiumEngine, ServiceConfig, UsageService};

#[tokio::main]
async fn main() {
    // .env を先に読む（RUST_LOG も .env で指定できるように）
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "water_usage_service=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        resource_url = %config.resource_url,
        cache = %config.cache.path.display(),
        ttl = ?config.cache.ttl,
        headless = config.browser.headless,
        "Starting water usage service"
    );

    let engine = Arc::new(ChromiumEngine::new(config.browser.clone()));
    let server_config = config.server.clone();
    let date_column = config.latest_date_column.clone();
    let service = UsageService::new(config, engine);

    if let Err(e) = server::serve(&server_config, build_router(service, date_column)).await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}
