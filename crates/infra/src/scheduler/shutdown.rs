//! Termination signals → cancellation token.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cancel `token` on SIGTERM or SIGINT (Ctrl-C elsewhere).
///
/// The controller only looks at the token at the top of a cycle, so an
/// in-flight cycle always runs to completion.
#[cfg(unix)]
pub fn install_signal_handlers(token: CancellationToken) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM; stopping after current cycle"),
            _ = sigint.recv() => info!("received SIGINT; stopping after current cycle"),
            _ = token.cancelled() => return,
        }
        token.cancel();
    }))
}

#[cfg(not(unix))]
pub fn install_signal_handlers(token: CancellationToken) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    info!("received Ctrl-C; stopping after current cycle");
                }
            }
            _ = token.cancelled() => return,
        }
        token.cancel();
    }))
}
