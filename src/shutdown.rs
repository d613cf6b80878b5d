use tokio::sync::watch;

/// Resolves when the exit flag changes. A dropped sender can never signal,
/// so it waits forever instead of firing on every poll.
pub async fn requested(must_exit: &mut watch::Receiver<bool>) {
    if must_exit.changed().await.is_err() {
        futures::future::pending::<()>().await;
    }
}
