//! Background persistence writer.
//!
//! Mutation callers never wait on disk: encoded updates are handed to
//! an unbounded channel and a worker task appends them as deltas,
//! retrying failed writes with a short delay. Past a threshold the
//! worker compacts the delta log into a fresh snapshot taken from the
//! live replica. On shutdown it compacts once more, so the usual
//! reopen path is a single snapshot read.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use caseboard_core::ReplicaDocument;

use super::rocks::DocumentStore;

/// Flusher tuning.
#[derive(Debug, Clone)]
pub struct FlushConfig {
    /// Deltas since the last snapshot before compaction kicks in.
    pub compact_threshold: u64,
    /// Delay between retries of a failed write.
    pub retry_delay: Duration,
    /// Retries before a delta is dropped (the in-memory replica stays
    /// authoritative; the next compaction recovers the data).
    pub max_retries: u32,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            compact_threshold: 64,
            retry_delay: Duration::from_millis(500),
            max_retries: 3,
        }
    }
}

enum FlushJob {
    Delta(Vec<u8>),
    Compact,
    Shutdown,
}

/// Cheap handle for enqueueing persistence work.
#[derive(Clone)]
pub struct FlushHandle {
    tx: mpsc::UnboundedSender<FlushJob>,
}

impl FlushHandle {
    /// Queue one encoded update for persistence. Never blocks.
    pub fn enqueue_update(&self, update: Vec<u8>) {
        if self.tx.send(FlushJob::Delta(update)).is_err() {
            log::warn!("Flush worker gone; dropping update");
        }
    }

    /// Ask for an immediate snapshot compaction.
    pub fn request_compact(&self) {
        let _ = self.tx.send(FlushJob::Compact);
    }

    /// Drain and stop the worker. The worker compacts before exiting;
    /// await its join handle for a best-effort final flush.
    pub fn shutdown(&self) {
        let _ = self.tx.send(FlushJob::Shutdown);
    }
}

/// Spawn the persistence worker for one open document.
pub fn spawn_flusher(
    store: Arc<DocumentStore>,
    replica: Arc<ReplicaDocument>,
    doc_id: Uuid,
    config: FlushConfig,
) -> (FlushHandle, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        // Resume version numbering where the store left off.
        let (mut next_version, mut since_snapshot) = match store.load_meta(doc_id) {
            Ok(meta) => (meta.version + 1, meta.delta_count),
            Err(_) => (1, 0),
        };

        while let Some(job) = rx.recv().await {
            match job {
                FlushJob::Delta(update) => {
                    let version = next_version;
                    next_version += 1;
                    if write_with_retry(&store, doc_id, version, &update, &config).await {
                        since_snapshot += 1;
                        if since_snapshot >= config.compact_threshold {
                            compact(&store, &replica, doc_id, next_version - 1);
                            since_snapshot = 0;
                        }
                    }
                }
                FlushJob::Compact => {
                    compact(&store, &replica, doc_id, next_version - 1);
                    since_snapshot = 0;
                }
                FlushJob::Shutdown => {
                    compact(&store, &replica, doc_id, next_version - 1);
                    break;
                }
            }
        }
    });

    (FlushHandle { tx }, task)
}

async fn write_with_retry(
    store: &DocumentStore,
    doc_id: Uuid,
    version: u64,
    update: &[u8],
    config: &FlushConfig,
) -> bool {
    let mut attempt = 0;
    loop {
        match store.store_delta(doc_id, version, update) {
            Ok(()) => return true,
            Err(e) => {
                attempt += 1;
                if attempt > config.max_retries {
                    log::error!("Dropping delta {version} for {doc_id} after {attempt} attempts: {e}");
                    return false;
                }
                log::warn!("Delta write failed for {doc_id} (attempt {attempt}): {e}");
                tokio::time::sleep(config.retry_delay).await;
            }
        }
    }
}

fn compact(store: &DocumentStore, replica: &ReplicaDocument, doc_id: Uuid, up_to_version: u64) {
    let snapshot = replica.encode_state();
    match store.save_snapshot(doc_id, &snapshot, up_to_version) {
        Ok(_) => {
            if let Err(e) = store.compact_deltas(doc_id, up_to_version) {
                log::warn!("Delta compaction failed for {doc_id}: {e}");
            }
        }
        Err(e) => log::error!("Snapshot write failed for {doc_id}: {e}"),
    }
}
