use anyhow::{Context, Result};
use facewatch_core::Config;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

mod engine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facewatchd starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        db = %config.db_path.display(),
        place = %config.place,
        "configuration loaded"
    );

    let mut engine = engine::spawn_engine(config).context("failed to start recognition engine")?;
    let handle = engine.handle().clone();
    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;

    tracing::info!("facewatchd ready");

    let exit = loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                break None;
            }
            exit = engine.exited() => break Some(exit),
            _ = hangup.recv() => {
                tracing::info!("SIGHUP received; retraining");
                match handle.retrain().await {
                    Ok(summary) => tracing::info!(
                        identities = summary.identities,
                        samples = summary.samples,
                        "retrain complete"
                    ),
                    Err(e) => tracing::warn!(error = %e, "retrain failed"),
                }
            }
        }
    };

    // Any engine exit before Ctrl-C is a failure.
    if let Some(exit) = exit {
        tracing::error!(?exit, "recognition engine stopped");
        tokio::task::spawn_blocking(move || engine.shutdown()).await??;
        anyhow::bail!("recognition engine stopped: {exit:?}");
    }

    tracing::info!("facewatchd shutting down");
    match handle.status().await {
        Ok(status) => tracing::info!(
            frames = status.frames,
            missing = status.missing_frames,
            faces = status.faces,
            events = status.events,
            "session totals"
        ),
        Err(e) => tracing::debug!(error = %e, "engine already stopped"),
    }

    tokio::task::spawn_blocking(move || engine.shutdown()).await??;
    Ok(())
}
