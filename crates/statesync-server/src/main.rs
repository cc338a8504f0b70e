//! statesync server - main entry point

use anyhow::Result;
use statesync_common::logging::{init_logging, LogConfig, LogOutput};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use statesync_server::{config::Config, db, pipeline::Pipeline};

#[tokio::main]
async fn main() -> Result<()> {
    // Console plus daily files under ./Logs, unless LOG_* says otherwise
    let log_config = LogConfig::builder()
        .output(LogOutput::Both)
        .log_file_prefix("statesync-server")
        .filter_directives("statesync_server=info,statesync_ingest=info,sqlx=warn")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    info!("Starting statesync server");

    let config = Config::load()?;
    info!(
        role = %config.role,
        channel = %config.channel.backend,
        queue = %config.channel.queue,
        directory = %config.ingest.directory.display(),
        "Configuration loaded"
    );

    let pool = db::create_pool(&config.database).await?;
    db::health_check(&pool).await?;
    db::run_migrations(&pool).await?;

    let pipeline = Pipeline::from_config(&config, pool.clone()).await?;

    let cancel = CancellationToken::new();
    let mut pipeline_task = tokio::spawn(pipeline.run(cancel.clone()));

    let outcome = tokio::select! {
        outcome = &mut pipeline_task => outcome,
        _ = shutdown_signal() => {
            cancel.cancel();
            info!(
                timeout_secs = config.shutdown_timeout_secs,
                "Waiting for in-flight work to finish"
            );
            match tokio::time::timeout(config.shutdown_timeout(), &mut pipeline_task).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!("Shutdown timed out, aborting pipeline");
                    pipeline_task.abort();
                    pool.close().await;
                    anyhow::bail!(
                        "Pipeline did not stop within {} seconds",
                        config.shutdown_timeout_secs
                    );
                }
            }
        }
    };

    pool.close().await;
    info!("Database pool closed");

    let report = outcome??;
    if !report.is_success() {
        error!(report = ?report, "Pipeline finished with failures");
        anyhow::bail!("Pipeline finished with failures");
    }

    info!("statesync server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}
