//! Service entry point

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tutor_engine::config::ServiceConfig;
use tutor_engine::engine::{Generator, InferenceEngine};
use tutor_engine::handler::RequestHandler;
use tutor_engine::server::{self, AppState};
use tutor_engine::session::SessionStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServiceConfig::from_env();
    config.validate()?;
    info!(
        version = tutor_engine::VERSION,
        model_path = %config.model.model_path.display(),
        "starting tutor service"
    );

    // A failed load leaves the process serving 503s rather than crashing,
    // so operators see the failure through /health instead of a dead port.
    let engine = match InferenceEngine::load(&config) {
        Ok(engine) => Some(Arc::new(engine)),
        Err(error) => {
            error!(%error, "failed to load model; serving degraded");
            None
        }
    };

    let device = engine
        .as_ref()
        .map(|e| e.info().device)
        .unwrap_or_else(|| "unknown".to_string());
    let generator = engine.map(|e| e as Arc<dyn Generator>);

    let store = Arc::new(SessionStore::new(config.session.clone()));
    let handler = RequestHandler::new(&config, store, generator);
    let state = Arc::new(AppState { handler, device });

    server::serve(&config.server, state).await
}
