//! Background flush scheduling
//!
//! Two interchangeable drivers for periodic [`StorageEngine::flush_buckets`]:
//! a dedicated thread ([`FlushTask`]) and an async loop on the tokio timer
//! ([`flush_loop`]). A failed flush is logged and retried on the next tick.

use crate::engine::StorageEngine;
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use kvfs_common::Result;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Dedicated flush thread
///
/// Stops when [`FlushTask::stop`] is called or the task is dropped.
pub struct FlushTask {
    stop_tx: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FlushTask {
    /// Start flushing `engine` every `interval`
    pub fn spawn(engine: Arc<StorageEngine>, interval: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("kvfs-flush".into())
            .spawn(move || {
                info!("Background flush thread started ({:?})", interval);
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = engine.flush_buckets() {
                                warn!("Background flush failed: {}", e);
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("Background flush thread stopped");
            })?;
        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Signal the thread and wait for it to exit
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Background flush thread panicked");
            }
        }
    }
}

impl Drop for FlushTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Long-running async task: flush all buckets every `interval`
pub async fn flush_loop(engine: Arc<StorageEngine>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let engine = Arc::clone(&engine);
        match tokio::task::spawn_blocking(move || engine.flush_buckets()).await {
            Ok(Ok(())) => debug!("Periodic flush done"),
            Ok(Err(e)) => warn!("Periodic flush failed: {e}"),
            Err(e) => error!("Periodic flush task failed: {e}"),
        }
    }
}
