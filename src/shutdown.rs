use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler listening for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` cancelled when either signal arrives. The
/// serve loop and the automatic-task loop watch this token; cancellation
/// stops RPC service and triggers deregistration from the service locator.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping component service");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping component service");
            }
        }

        token_clone.cancel();
    });

    token
}
