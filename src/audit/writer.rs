use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;

use super::store::AuditStore;
use super::{RecordDraft, RunRecord};
use crate::error::{EngineError, EngineResult};

const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

type AppendReply = oneshot::Sender<EngineResult<RunRecord>>;

/// Cheaply cloneable handle for appending run records.
///
/// Every append goes through one background task, so the chain head is read
/// and extended by a single writer no matter how many executions finish at
/// once.
#[derive(Clone)]
pub struct AuditWriter {
    tx: mpsc::Sender<(RecordDraft, AppendReply)>,
}

impl AuditWriter {
    /// Queue a record and wait for it to be stored.
    pub async fn append(&self, draft: RecordDraft) -> EngineResult<RunRecord> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((draft, reply_tx))
            .await
            .map_err(|_| EngineError::AuditPersistenceFailed("audit writer has stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| EngineError::AuditPersistenceFailed("audit writer dropped the append".into()))?
    }
}

/// Create the background writer and return the AuditWriter handle.
///
/// The caller spawns the returned future on its runtime. It finishes once
/// every handle has been dropped.
pub fn create(
    store: Arc<AuditStore>,
    capacity: usize,
    retention: Option<chrono::Duration>,
) -> (AuditWriter, impl std::future::Future<Output = ()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let writer = AuditWriter { tx };
    let future = run(rx, store, retention);
    (writer, future)
}

async fn run(
    mut rx: mpsc::Receiver<(RecordDraft, AppendReply)>,
    store: Arc<AuditStore>,
    retention: Option<chrono::Duration>,
) {
    let mut retention_tick = interval(RETENTION_INTERVAL);
    // Consume the first immediate tick
    retention_tick.tick().await;

    loop {
        tokio::select! {
            request = rx.recv() => {
                let Some((draft, reply)) = request else {
                    break;
                };
                let result = blocking(&store, move |store| store.append(draft)).await;
                if let Err(ref e) = result {
                    log::error!("Audit append failed: {}", e);
                }
                // The caller may have gone away; the record is stored regardless
                let _ = reply.send(result);
            }
            _ = retention_tick.tick(), if retention.is_some() => {
                let Some(keep) = retention else { continue };
                let cutoff = chrono::Utc::now() - keep;
                match blocking(&store, move |store| store.prune_before(cutoff)).await {
                    Ok(0) => {}
                    Ok(n) => log::info!("Audit retention: purged {} old records", n),
                    Err(e) => log::error!("Audit retention failed: {}", e),
                }
            }
        }
    }
    log::debug!("Audit writer stopped");
}

async fn blocking<T, F>(store: &Arc<AuditStore>, f: F) -> EngineResult<T>
where
    T: Send + 'static,
    F: FnOnce(&AuditStore) -> EngineResult<T> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| EngineError::AuditPersistenceFailed(format!("audit task failed: {}", e)))?
}
