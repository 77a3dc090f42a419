//! Process-level plumbing: panic visibility and shutdown signalling.

use tokio::sync::watch;
use tracing::error;

/// Makes panics visible in logs before the default hook runs.
pub fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown".to_string());
        error!("Panic at {}: {}", location, info);
        eprintln!("PANIC at {}: {}", location, info);
        default_hook(info);
    }));
}

/// Shutdown signal pair. Flip the sender to `true` to stop all loops
/// listening on the receiver.
pub fn shutdown_signal() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Blocks until the shutdown signal flips to `true`.
pub async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}
