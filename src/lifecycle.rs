//! Process lifecycle: signal handling, the background watcher loop, and
//! graceful shutdown sequencing shared by `serve` and `watch`.

use crate::store::VectorStore;
use crate::updater::IncrementalUpdater;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Shared flag observed by the watcher loop and anything else that needs to
/// notice a shutdown request without owning a signal handler itself.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Waits for `SIGINT`/`ctrl_c`, and on unix also `SIGTERM`, then sets the
/// flag. Runs until the process is asked to exit; intended to be spawned
/// once at startup.
pub async fn install_signal_handlers(flag: ShutdownFlag) {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("shutdown signal received");
    flag.set();
}

/// Polls in slices no longer than 100ms so shutdown is observed promptly,
/// invoking the updater once per `interval_seconds` tick until the shutdown
/// flag is set.
pub async fn run_watcher(updater: Arc<Mutex<IncrementalUpdater>>, store: Arc<VectorStore>, interval_seconds: u64, flag: ShutdownFlag) {
    const POLL_SLICE: Duration = Duration::from_millis(100);
    let tick = Duration::from_secs(interval_seconds.max(1));

    let mut elapsed = Duration::ZERO;
    while !flag.is_set() {
        tokio::time::sleep(POLL_SLICE).await;
        elapsed += POLL_SLICE;
        if elapsed < tick {
            continue;
        }
        elapsed = Duration::ZERO;

        let mut updater = updater.lock().await;
        match updater.detect_changes(&store).await {
            Ok(info) => {
                if let Err(err) = updater.apply(&info, &store).await {
                    tracing::error!(error = %err, "watcher update failed");
                }
            }
            Err(err) => tracing::error!(error = %err, "watcher change detection failed"),
        }
    }

    tracing::info!("watcher loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_starts_unset_and_latches_once_set() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_set());
        flag.set();
        assert!(flag.is_set());
    }

    #[tokio::test]
    async fn watcher_exits_promptly_once_flag_is_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            VectorStore::open(&crate::config::DatabaseConfig {
                sqlite_path: dir.path().join("s.db"),
                index_path: dir.path().join("i.usearch"),
                vector_dim: 3,
                max_elements: 64,
                distance_metric: crate::config::DistanceMetric::Cosine,
            })
            .await
            .unwrap(),
        );
        let collector = crate::source::SourceCollector::new(crate::config::SourceConfig::default());
        let chunker = crate::chunker::Chunker::new(
            Arc::new(crate::tokenizer::Tokenizer::fallback()),
            crate::chunker::ChunkerConfig::default(),
        );
        let updater = Arc::new(Mutex::new(IncrementalUpdater::new(collector, chunker, None, 8)));

        let flag = ShutdownFlag::new();
        flag.set();

        let start = std::time::Instant::now();
        run_watcher(updater, store, 3600, flag).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
