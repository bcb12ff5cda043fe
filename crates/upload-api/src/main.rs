//! Upload service binary.
//!
//! Accepts application bundles over HTTP and drives their build and
//! deployment in the background.

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use upload_api::{
    api, BundleReceiver, JobStore, KubectlRevisions, Pipeline, PipelineMode, ScriptRunner,
    ServiceConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("upload_api=info".parse()?))
        .init();

    info!("upload service starting");

    let config = ServiceConfig::load()?;

    tokio::fs::create_dir_all(&config.upload_root).await?;

    let mode = pipeline_mode(&config);
    info!(
        listen = %config.listen_addr(),
        upload_root = %config.upload_root.display(),
        max_upload_bytes = config.max_upload_bytes,
        ?mode,
        "configuration loaded"
    );

    let store = Arc::new(JobStore::new());
    let receiver = BundleReceiver::new(
        &config.upload_root,
        config.max_upload_bytes,
        Arc::clone(&store),
    );
    let pipeline = Arc::new(Pipeline::new(Arc::clone(&store), mode));

    let state = Arc::new(api::AppState {
        store,
        receiver,
        pipeline: Arc::clone(&pipeline),
    });
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr()).await?;
    info!(addr = %config.listen_addr(), "upload service listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if pipeline.in_flight() > 0 {
        info!(
            in_flight = pipeline.in_flight(),
            "waiting for pipeline tasks to finish"
        );
    }
    pipeline.drain().await;

    info!("upload service shutdown complete");
    Ok(())
}

fn pipeline_mode(config: &ServiceConfig) -> PipelineMode {
    if config.mock_deploy {
        return PipelineMode::Mock {
            step_delay: config.mock_step_delay(),
        };
    }

    let script = config.script_path();
    if !script.is_file() {
        warn!(script = %script.display(), "build/deploy script not found; jobs will fail");
    }
    PipelineMode::Real {
        runner: Arc::new(ScriptRunner::new(script)),
        revisions: Arc::new(KubectlRevisions::new(&config.revision_command)),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
    }
}
