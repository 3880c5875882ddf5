//! Debounced write-back of the visitor aggregate
//!
//! Mutations only mark the state dirty. A background task owns the storage
//! backend and saves once the state has been quiet for the debounce window,
//! so a burst of page views costs a single write. Every backend call (save,
//! flush, reload) runs on this task, one at a time.

use chrono::Utc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{SharedBackend, StorageError, StorageResult};
use crate::counter::SharedState;

#[derive(Debug, Clone, Copy)]
pub struct WriteBackSettings {
    /// Quiet period after the last mutation before saving
    pub debounce: Duration,
    /// Delay before retrying a failed save
    pub retry: Duration,
}

impl Default for WriteBackSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            retry: Duration::from_secs(5),
        }
    }
}

enum Command {
    MarkDirty,
    Flush(oneshot::Sender<StorageResult<()>>),
    Reload(oneshot::Sender<()>),
}

/// Handle for notifying the write-back task
#[derive(Clone)]
pub struct WriteBackHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl WriteBackHandle {
    /// Restart the debounce window
    pub fn mark_dirty(&self) {
        if self.tx.send(Command::MarkDirty).is_err() {
            warn!("Write-back task stopped, change will not be persisted");
        }
    }

    /// Save the current state now, bypassing any pending timer
    pub async fn flush(&self) -> StorageResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(reply))
            .map_err(|_| StorageError::Closed)?;
        rx.await.map_err(|_| StorageError::Closed)?
    }

    /// Replace the in-memory state with the stored snapshot, unless there are
    /// local changes that have not been persisted yet
    pub async fn reload(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Reload(reply)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Start the write-back task for `state`.
///
/// `loaded` is false when the stored snapshot could not be read at startup;
/// saves are then held back until a load succeeds and local views have been
/// merged on top of it.
pub async fn start_write_back(
    state: SharedState,
    backend: SharedBackend,
    settings: WriteBackSettings,
    loaded: bool,
) -> WriteBackHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let persisted_revision = state.read().await.revision();
    let writer = Writer {
        state,
        backend,
        persisted_revision,
        loaded,
    };

    tokio::spawn(write_back_task(writer, rx, settings));

    WriteBackHandle { tx }
}

struct Writer {
    state: SharedState,
    backend: SharedBackend,
    /// Revision of the state as of the last successful save or reload
    persisted_revision: u64,
    /// Whether the in-memory state includes the stored snapshot
    loaded: bool,
}

impl Writer {
    async fn is_dirty(&self) -> bool {
        self.state.read().await.revision() != self.persisted_revision
    }

    /// Read the stored snapshot that startup could not, and fold the views
    /// counted since then into it
    async fn catch_up(&mut self) -> StorageResult<()> {
        if self.loaded {
            return Ok(());
        }

        let stored = match self.backend.load().await {
            Ok(stored) => stored,
            Err(StorageError::Corrupt(reason)) => {
                warn!("Ignoring corrupt visitor snapshot: {}", reason);
                None
            }
            Err(e) => {
                warn!(
                    "Visitor data in {} backend still unreadable, holding saves: {}",
                    self.backend.name(),
                    e
                );
                return Err(e);
            }
        };

        if let Some(mut stored) = stored {
            let mut state = self.state.write().await;
            stored.merge(state.aggregate());
            info!(
                "Loaded visitor data from {} backend ({} views after merging)",
                self.backend.name(),
                stored.total_views()
            );
            state.replace(stored);
        }
        self.loaded = true;
        Ok(())
    }

    async fn persist(&mut self) -> StorageResult<()> {
        self.catch_up().await?;

        let saved_at = Utc::now();
        let (mut snapshot, revision) = {
            let state = self.state.read().await;
            (state.aggregate().clone(), state.revision())
        };
        snapshot.mark_persisted(saved_at);

        match self.backend.save(&snapshot).await {
            Ok(()) => {
                self.persisted_revision = revision;
                self.state.write().await.mark_persisted(saved_at);
                debug!(
                    "Saved visitor data to {} backend ({} views)",
                    self.backend.name(),
                    snapshot.total_views()
                );
                Ok(())
            }
            Err(e) => {
                error!("Failed to save visitor data to {} backend: {}", self.backend.name(), e);
                Err(e)
            }
        }
    }

    async fn reload(&mut self) {
        if !self.loaded {
            // Catching up already folds in the stored snapshot
            let _ = self.catch_up().await;
            return;
        }

        if self.is_dirty().await {
            debug!("Skipping reload, local changes not yet saved");
            return;
        }

        match self.backend.load().await {
            Ok(Some(aggregate)) => {
                let mut state = self.state.write().await;
                // A view may have been recorded while loading
                if state.revision() == self.persisted_revision {
                    state.replace(aggregate);
                    self.persisted_revision = state.revision();
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to reload visitor data from {} backend: {}", self.backend.name(), e),
        }
    }
}

async fn write_back_task(
    mut writer: Writer,
    mut rx: mpsc::UnboundedReceiver<Command>,
    settings: WriteBackSettings,
) {
    let mut deadline: Option<Instant> = None;

    info!(
        "Write-back started (backend={}, debounce={}ms)",
        writer.backend.name(),
        settings.debounce.as_millis()
    );

    loop {
        tokio::select! {
            command = rx.recv() => {
                match command {
                    Some(Command::MarkDirty) => {
                        deadline = Some(Instant::now() + settings.debounce);
                    }
                    Some(Command::Flush(reply)) => {
                        let result = writer.persist().await;
                        deadline = result.is_err().then(|| Instant::now() + settings.retry);
                        let _ = reply.send(result);
                    }
                    Some(Command::Reload(reply)) => {
                        writer.reload().await;
                        let _ = reply.send(());
                    }
                    None => {
                        // All handles dropped, save what is left and exit
                        if writer.is_dirty().await {
                            let _ = writer.persist().await;
                        }
                        info!("Write-back shutting down");
                        break;
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                if writer.is_dirty().await && writer.persist().await.is_err() {
                    deadline = Some(Instant::now() + settings.retry);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::CounterState;
    use crate::storage::tests::{sample_aggregate, MemoryBackend};
    use crate::visitors::{DayKeyResolver, Identity, VisitorAggregate};
    use std::sync::Arc;
    use tokio::sync::RwLock;

    const DEBOUNCE: Duration = Duration::from_millis(500);
    const RETRY: Duration = Duration::from_secs(5);

    async fn setup(backend: &Arc<MemoryBackend>) -> (SharedState, WriteBackHandle) {
        let state = Arc::new(RwLock::new(CounterState::new(VisitorAggregate::new())));
        let handle = start_write_back(
            state.clone(),
            backend.clone(),
            WriteBackSettings {
                debounce: DEBOUNCE,
                retry: RETRY,
            },
            true,
        )
        .await;
        (state, handle)
    }

    async fn record(state: &SharedState, handle: &WriteBackHandle, who: &str) {
        let identity = Identity::from_request(Some(who), Some("agent"));
        state
            .write()
            .await
            .record_view(&DayKeyResolver::utc(), Utc::now(), identity);
        handle.mark_dirty();
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_into_one_save() {
        let backend = Arc::new(MemoryBackend::default());
        let (state, handle) = setup(&backend).await;

        for i in 0..10 {
            record(&state, &handle, &format!("10.0.0.{i}")).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(backend.save_count(), 0);

        tokio::time::sleep(DEBOUNCE).await;
        assert_eq!(backend.save_count(), 1);

        let saved = backend.stored().unwrap();
        assert_eq!(saved.total_views(), 10);
        assert_eq!(saved.total_uniques(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_saves_immediately_and_cancels_timer() {
        let backend = Arc::new(MemoryBackend::default());
        let (state, handle) = setup(&backend).await;

        record(&state, &handle, "A").await;
        record(&state, &handle, "B").await;
        handle.flush().await.unwrap();
        assert_eq!(backend.save_count(), 1);
        assert_eq!(backend.stored().unwrap().total_views(), 2);

        tokio::time::sleep(DEBOUNCE * 4).await;
        assert_eq!(backend.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_save_then_later_save_persists_latest() {
        let backend = Arc::new(MemoryBackend::default());
        backend.fail_next(1);
        let (state, handle) = setup(&backend).await;

        record(&state, &handle, "A").await;
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(10)).await;
        assert_eq!(backend.save_count(), 0);
        assert_eq!(state.read().await.aggregate().total_views(), 1);

        record(&state, &handle, "B").await;
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(10)).await;

        let stored = backend.stored().unwrap();
        assert_eq!(stored.total_views(), 2);
        assert_eq!(&stored, state.read().await.aggregate());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_save_is_retried_without_new_views() {
        let backend = Arc::new(MemoryBackend::default());
        backend.fail_next(1);
        let (state, handle) = setup(&backend).await;

        record(&state, &handle, "A").await;
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(10)).await;
        assert_eq!(backend.save_count(), 0);

        tokio::time::sleep(RETRY).await;
        assert_eq!(backend.save_count(), 1);
        assert_eq!(backend.stored().unwrap().total_views(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_reports_failure() {
        let backend = Arc::new(MemoryBackend::default());
        backend.fail_next(1);
        let (state, handle) = setup(&backend).await;

        record(&state, &handle, "A").await;
        assert!(handle.flush().await.is_err());
        handle.flush().await.unwrap();
        assert_eq!(backend.stored().unwrap().total_views(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_adopts_stored_state_when_clean() {
        let backend = Arc::new(MemoryBackend::shared_store());
        let (state, handle) = setup(&backend).await;

        // Another instance wrote to the shared record
        backend.put(sample_aggregate());
        handle.reload().await;

        assert_eq!(state.read().await.aggregate(), &sample_aggregate());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_keeps_unsaved_local_views() {
        let backend = Arc::new(MemoryBackend::shared_store());
        let (state, handle) = setup(&backend).await;

        backend.put(sample_aggregate());
        record(&state, &handle, "A").await;
        handle.reload().await;

        assert_eq!(state.read().await.aggregate().total_views(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handles_saves_pending_changes() {
        let backend = Arc::new(MemoryBackend::default());
        let (state, handle) = setup(&backend).await;

        record(&state, &handle, "A").await;
        drop(handle);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(backend.save_count(), 1);
    }
}
