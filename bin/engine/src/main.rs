use runwright_core::Result;
use runwright_engine::config::EngineConfig;
use runwright_engine::error::StartupError;
use runwright_engine::runtime::Engine;
use runwright_workflow::HandlerRegistry;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = EngineConfig::from_env().map_err(|e| StartupError::Config {
        details: e.to_string(),
    })?;
    tracing::info!("Loaded configuration");

    let registry = HandlerRegistry::with_builtins(reqwest::Client::new());
    let engine = Engine::start(config, registry).await?;

    let shutdown = engine.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl-C"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C"),
        }
        shutdown.cancel();
    });

    engine.run().await;
    Ok(())
}
