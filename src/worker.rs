use crate::utils::UploadStore;
use std::time::Duration;
use tracing::{debug, error, info, instrument};

/// Periodically remove uploads older than `ttl`. Runs until the task is
/// dropped.
#[instrument(skip(store), fields(dir = ?store.dir()))]
pub async fn run(store: UploadStore, ttl: Duration, interval: Duration) {
    info!(?ttl, ?interval, "Starting upload cleanup worker");

    let mut iteration_count: u64 = 0;
    loop {
        iteration_count += 1;
        debug!(iteration = iteration_count, "Starting upload cleanup cycle");

        match sweep(&store, ttl).await {
            Ok(0) => debug!(iteration = iteration_count, "No expired uploads"),
            Ok(removed) => info!(iteration = iteration_count, removed, "Removed expired uploads"),
            Err(e) => error!(iteration = iteration_count, ?e, "Upload cleanup failed"),
        }

        debug!(sleep_duration = ?interval, "Sleeping until next cleanup cycle");
        tokio::time::sleep(interval).await;
    }
}

async fn sweep(store: &UploadStore, ttl: Duration) -> std::io::Result<usize> {
    let store = store.clone();
    tokio::task::spawn_blocking(move || store.cleanup_expired(ttl))
        .await
        .map_err(std::io::Error::other)?
}
