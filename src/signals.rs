//! Shared shutdown-signal wait, used by the `sleep` placeholder command and
//! by anything else that just needs to block until the process is asked to
//! stop.

#[cfg(unix)]
pub async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("received SIGTERM, exiting"),
        _ = sigint.recv() => tracing::info!("received SIGINT, exiting"),
    }
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
    tracing::info!("received Ctrl+C, exiting");
}
