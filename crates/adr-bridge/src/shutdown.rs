//! Process-wide shutdown signal shared by every long-running task.

use tokio::sync::watch;

/// Resolve once `rx` carries `true` or its sender is gone.
///
/// Cancel-safe, so it can sit in a `tokio::select!` arm that is rebuilt on
/// every loop iteration.
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
