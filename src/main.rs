use std::net::SocketAddr;

use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod checkpoint;
mod config;
mod error;
mod labels;
mod model;
mod predict;
mod preprocess;
mod routes;
mod utils;

use config::Config;
use error::Error;
use labels::LabelStore;
use model::Model;
use predict::Predictor;
use preprocess::Preprocessor;
use routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flower_classifier=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!("Starting flower classifier");

    let labels = LabelStore::load(&config.labels_path)?;
    utils::ensure_backbone(&config.backbone_path, config.backbone_url.as_deref()).await?;
    let model = Model::load(&config)?;
    info!("Using {} backbone", model.arch());

    let predictor = Predictor::new(
        model,
        labels,
        Preprocessor::new(config.crop_mode),
        config.label_mapping,
        config.top_k,
    );
    info!(
        "Serving top-{} predictions ({:?} crop, {:?} label mapping)",
        predictor.top_k(),
        config.crop_mode,
        config.label_mapping
    );

    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .map_err(|e| Error::io(&config.upload_dir, e))?;
    let state = AppState::new(predictor, config.upload_dir.clone());
    let app = routes::create_router(state, config.body_limit_bytes);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Listening on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
