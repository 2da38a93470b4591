use poem::listener::TcpListener;
use card_renderer::core::pipeline::ExportEngine;
use card_renderer::core::usage::UsageLogger;
use card_renderer::settings::{EnvSource, get_config};
use card_renderer::{AppState, init_openapi_route};
use tracing::Level;
use url::Url;

use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = get_config()?;

    let log_level = Level::DEBUG;
    // Logging to File
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "app.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_max_level(log_level)
        .init();

    tracing::info!("Initializing Card Export Service...");
    tracing::info!("using {} as environment variables", EnvSource::current());
    tracing::info!("run with config: {:?}", config);

    let engine = Arc::new(ExportEngine::new(&config)?);
    let usage = match config.usage_log_url.as_deref() {
        Some(url) => UsageLogger::new(Some(Url::parse(url)?)),
        None => UsageLogger::disabled(),
    };

    // Init App State
    let app_state = Arc::new(AppState { engine, usage });

    tracing::info!(
        "Export engine initialized with {} backend",
        app_state.engine.backend()
    );

    let app = init_openapi_route(app_state.clone(), &config);
    tracing::info!("run server on {}:{}", config.host, config.port);
    poem::Server::new(TcpListener::bind(format!(
        "{}:{}",
        config.host, config.port
    )))
    .run(app)
    .await?;
    Ok(())
}
