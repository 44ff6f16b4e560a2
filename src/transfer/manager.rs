//! Download lifecycle manager
//!
//! Each artifact id owns one slot holding its transfer state. Every
//! transition is persisted while the slot's state lock is held, so the
//! record store always mirrors memory. Lock order is map, then the slot's
//! control lock, then its state lock. Workers only ever take the state lock.

use super::fetch::{FetchRequest, Fetcher};
use super::state::{
    FailureKind, TransferEvent, TransferFailure, TransferProgress, TransferState, TransferStatus,
};
use crate::analytics::StorageAnalyticsEngine;
use crate::artifacts::{ArtifactFileStore, InstalledArtifact, partial_path, sanitize_id};
use crate::catalog::ArtifactDescriptor;
use crate::error::{ManagerError, ManagerResult};
use crate::metrics;
use crate::personalization::PersonalizationStore;
use crate::store::{DOWNLOAD_STATE_PREFIX, RecordStore, download_state_key};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, RwLock, Semaphore, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tunables for the download manager
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    /// Transfers allowed to stream at once; others wait for a permit
    pub max_concurrent: usize,
    /// Allowed size deviation as a fraction of the declared size
    pub integrity_tolerance: f64,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            integrity_tolerance: 0.10,
        }
    }
}

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct SlotState {
    transfer: TransferState,
    /// Incremented per worker; stale workers drop their updates
    generation: u64,
    worker: Option<Worker>,
    bytes_per_sec: f64,
    persisted_percent: u64,
}

impl SlotState {
    fn snapshot(&self) -> TransferProgress {
        self.transfer.snapshot(self.bytes_per_sec)
    }

    fn owned_by(&self, generation: u64) -> bool {
        self.generation == generation && self.transfer.status == TransferStatus::Downloading
    }
}

struct Slot {
    /// Serializes pause/resume/cancel/delete for one id
    control: Mutex<()>,
    state: Mutex<SlotState>,
}

impl Slot {
    fn new(transfer: TransferState) -> Arc<Self> {
        Arc::new(Self {
            control: Mutex::new(()),
            state: Mutex::new(SlotState {
                persisted_percent: transfer.progress.floor() as u64,
                transfer,
                generation: 0,
                worker: None,
                bytes_per_sec: 0.0,
            }),
        })
    }
}

struct Throughput {
    started: Instant,
    base_bytes: u64,
}

impl Throughput {
    fn start(base_bytes: u64) -> Self {
        Self {
            started: Instant::now(),
            base_bytes,
        }
    }

    fn rate(&self, bytes: u64) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        bytes.saturating_sub(self.base_bytes) as f64 / secs
    }
}

struct Inner {
    records: RecordStore,
    files: ArtifactFileStore,
    fetcher: Arc<dyn Fetcher>,
    analytics: Arc<StorageAnalyticsEngine>,
    personalization: PersonalizationStore,
    settings: DownloadSettings,
    slots: RwLock<HashMap<String, Arc<Slot>>>,
    permits: Arc<Semaphore>,
    next_generation: AtomicU64,
    events: broadcast::Sender<TransferEvent>,
}

/// Owns every artifact transfer: acquisition, pause, resume, cancel, delete
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    pub fn new(
        records: RecordStore,
        files: ArtifactFileStore,
        fetcher: Arc<dyn Fetcher>,
        analytics: Arc<StorageAnalyticsEngine>,
        settings: DownloadSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let permits = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));

        Self {
            inner: Arc::new(Inner {
                personalization: PersonalizationStore::new(records.clone()),
                records,
                files,
                fetcher,
                analytics,
                settings,
                slots: RwLock::new(HashMap::new()),
                permits,
                next_generation: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    pub fn files(&self) -> &ArtifactFileStore {
        &self.inner.files
    }

    /// Personalization records removed alongside deleted artifacts
    pub fn personalization(&self) -> &PersonalizationStore {
        &self.inner.personalization
    }

    // ========================================================================
    // Lifecycle operations
    // ========================================================================

    /// Start downloading an artifact
    ///
    /// Fails with `AlreadyActive` while a non-terminal transfer exists for
    /// the id. Free space is checked before anything is created. Acquiring an
    /// already completed artifact returns its state unchanged.
    pub async fn acquire(&self, descriptor: ArtifactDescriptor) -> ManagerResult<TransferProgress> {
        let id = descriptor.id.clone();
        let mut slots = self.inner.slots.write().await;

        if let Some(existing) = slots.get(&id) {
            let state = existing.state.lock().await;
            match state.transfer.status {
                TransferStatus::Completed => return Ok(state.snapshot()),
                status if !status.is_terminal() => {
                    return Err(ManagerError::AlreadyActive { id });
                }
                _ => {}
            }
        }

        // Distinct ids can sanitize to one directory; the first one keeps it
        let dir_name = sanitize_id(&id);
        for (other, slot) in slots.iter() {
            if *other == id || sanitize_id(other) != dir_name {
                continue;
            }
            let status = slot.state.lock().await.transfer.status;
            if matches!(status, TransferStatus::Failed | TransferStatus::Cancelled) {
                continue;
            }
            return Err(ManagerError::PathConflict {
                id,
                owner: other.clone(),
            });
        }
        if let Some(owner) = self.inner.files.foreign_owner(&id).await? {
            return Err(ManagerError::PathConflict { id, owner });
        }

        self.check_free_space(descriptor.declared_bytes()).await?;

        let mut transfer = TransferState::new(descriptor);
        self.persist(&transfer).await?;
        self.emit(TransferEvent::StatusChanged {
            id: id.clone(),
            status: TransferStatus::Pending,
        });

        transfer.set_status(TransferStatus::Downloading);
        self.persist(&transfer).await?;

        let slot = Slot::new(transfer);
        let snapshot = {
            let mut state = slot.state.lock().await;
            self.spawn_worker(&slot, &mut state);
            state.snapshot()
        };
        slots.insert(id.clone(), slot);

        self.emit(TransferEvent::StatusChanged {
            id: id.clone(),
            status: TransferStatus::Downloading,
        });
        metrics::record_download_started(&id);
        tracing::info!(model_id = %id, total_bytes = snapshot.total_bytes, "Transfer started");

        Ok(snapshot)
    }

    /// Stop a running transfer, keeping its partial payload for resume
    pub async fn pause(&self, id: &str) -> ManagerResult<TransferProgress> {
        let slot = self.slot(id).await?;
        let _control = slot.control.lock().await;

        let worker = {
            let mut state = slot.state.lock().await;
            match state.transfer.status {
                TransferStatus::Paused => return Ok(state.snapshot()),
                TransferStatus::Downloading => {}
                status => {
                    return Err(ManagerError::InvalidTransition {
                        id: id.to_string(),
                        action: "pause",
                        status,
                    });
                }
            }
            self.transition(&mut state, TransferStatus::Paused).await?;
            state.bytes_per_sec = 0.0;
            state.worker.take()
        };

        if let Some(worker) = worker {
            worker.token.cancel();
            join_worker(id, worker).await;
        }

        let snapshot = slot.state.lock().await.snapshot();
        tracing::info!(model_id = %id, progress = snapshot.progress, "Transfer paused");
        Ok(snapshot)
    }

    /// Continue a paused transfer
    ///
    /// With a range-capable fetcher the interrupted file continues from its
    /// partial length; otherwise it restarts from byte zero and a
    /// `Restarted` event is emitted.
    pub async fn resume(&self, id: &str) -> ManagerResult<TransferProgress> {
        let slot = self.slot(id).await?;
        let _control = slot.control.lock().await;
        let mut state = slot.state.lock().await;

        let status = state.transfer.status;
        if status != TransferStatus::Paused {
            return Err(ManagerError::InvalidTransition {
                id: id.to_string(),
                action: "resume",
                status,
            });
        }

        let remaining = state
            .transfer
            .total_bytes
            .saturating_sub(state.transfer.bytes_transferred);
        self.check_free_space(remaining).await?;

        self.transition(&mut state, TransferStatus::Downloading).await?;
        self.spawn_worker(&slot, &mut state);

        tracing::info!(
            model_id = %id,
            progress = state.transfer.progress,
            range_resume = self.inner.fetcher.supports_range(),
            "Transfer resumed"
        );
        Ok(state.snapshot())
    }

    /// Abort a transfer and erase every trace of it
    ///
    /// Waits for the worker to release the payload, then removes the
    /// artifact directory and the persisted state. `Cancelled` is only
    /// broadcast, never stored.
    pub async fn cancel(&self, id: &str) -> ManagerResult<()> {
        let mut slots = self.inner.slots.write().await;
        let slot = slots
            .get(id)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound { id: id.to_string() })?;
        let _control = slot.control.lock().await;

        let worker = {
            let mut state = slot.state.lock().await;
            let status = state.transfer.status;
            if status.is_terminal() {
                return Err(ManagerError::InvalidTransition {
                    id: id.to_string(),
                    action: "cancel",
                    status,
                });
            }
            state.transfer.set_status(TransferStatus::Cancelled);
            state.worker.take()
        };

        if let Some(worker) = worker {
            worker.token.cancel();
            join_worker(id, worker).await;
        }

        self.inner.files.remove_artifact(id).await?;
        self.inner.records.delete(&download_state_key(id)).await?;
        slots.remove(id);
        drop(slots);

        self.emit(TransferEvent::Cancelled { id: id.to_string() });
        metrics::record_download_cancelled(id);
        tracing::info!(model_id = %id, "Transfer cancelled");
        Ok(())
    }

    /// Remove an installed artifact with its metadata, transfer record and
    /// personalization. Returns the bytes reclaimed.
    pub async fn delete(&self, id: &str) -> ManagerResult<u64> {
        let mut slots = self.inner.slots.write().await;

        if let Some(slot) = slots.get(id) {
            let state = slot.state.lock().await;
            if !state.transfer.status.is_terminal() {
                return Err(ManagerError::AlreadyActive { id: id.to_string() });
            }
        }

        if self.inner.files.read_metadata(id).await?.is_none() {
            return Err(ManagerError::NotInstalled { id: id.to_string() });
        }

        let reclaimed = self.inner.files.remove_artifact(id).await?;
        self.inner.records.delete(&download_state_key(id)).await?;
        self.inner.personalization.remove(id).await?;
        slots.remove(id);
        drop(slots);

        self.emit(TransferEvent::Removed { id: id.to_string() });
        metrics::record_bytes_reclaimed(reclaimed);
        tracing::info!(model_id = %id, bytes = reclaimed, "Artifact deleted");

        self.inner.analytics.recompute().await;
        Ok(reclaimed)
    }

    /// Reload persisted transfer states
    ///
    /// Transfers left pending or downloading by a previous process come back
    /// paused so they can be resumed explicitly.
    pub async fn restore(&self) -> ManagerResult<Vec<TransferProgress>> {
        let keys = self.inner.records.keys(DOWNLOAD_STATE_PREFIX).await?;
        let mut slots = self.inner.slots.write().await;
        let mut restored = Vec::new();

        for key in keys {
            let mut transfer: TransferState = match self.inner.records.get(&key).await {
                Ok(Some(transfer)) => transfer,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping unreadable transfer record");
                    continue;
                }
            };

            if slots.contains_key(&transfer.id) {
                continue;
            }

            if matches!(
                transfer.status,
                TransferStatus::Pending | TransferStatus::Downloading
            ) {
                transfer.set_status(TransferStatus::Paused);
                self.persist(&transfer).await?;
                tracing::info!(model_id = %transfer.id, "Interrupted transfer restored as paused");
            }

            restored.push(transfer.snapshot(0.0));
            slots.insert(transfer.id.clone(), Slot::new(transfer));
        }

        tracing::info!(count = restored.len(), "Restored transfer states");
        Ok(restored)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn progress(&self, id: &str) -> ManagerResult<TransferProgress> {
        let slot = self.slot(id).await?;
        let state = slot.state.lock().await;
        Ok(state.snapshot())
    }

    /// All known transfer states, sorted by id
    pub async fn states(&self) -> Vec<TransferState> {
        let slots: Vec<Arc<Slot>> = self.inner.slots.read().await.values().cloned().collect();

        let mut states = Vec::with_capacity(slots.len());
        for slot in slots {
            states.push(slot.state.lock().await.transfer.clone());
        }
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }

    pub async fn installed(&self) -> ManagerResult<Vec<InstalledArtifact>> {
        Ok(self.inner.files.list_installed().await?)
    }

    pub async fn is_installed(&self, id: &str) -> ManagerResult<bool> {
        Ok(self.inner.files.read_metadata(id).await?.is_some())
    }

    pub async fn local_path(&self, id: &str) -> ManagerResult<Option<PathBuf>> {
        Ok(self
            .inner
            .files
            .read_metadata(id)
            .await?
            .map(|installed| installed.local_path))
    }

    /// Wait until a transfer leaves the pending/downloading states
    pub async fn wait(&self, id: &str) -> ManagerResult<TransferProgress> {
        let mut events = self.subscribe();
        loop {
            let snapshot = self.progress(id).await?;
            if !matches!(
                snapshot.status,
                TransferStatus::Pending | TransferStatus::Downloading
            ) {
                return Ok(snapshot);
            }
            match events.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return Ok(snapshot),
            }
        }
    }

    // ========================================================================
    // Worker
    // ========================================================================

    fn spawn_worker(&self, slot: &Arc<Slot>, state: &mut SlotState) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();

        let manager = self.clone();
        let worker_slot = slot.clone();
        let worker_token = token.clone();
        let handle = tokio::spawn(async move {
            manager.run_worker(worker_slot, generation, worker_token).await;
        });

        state.generation = generation;
        state.worker = Some(Worker { token, handle });
    }

    async fn run_worker(self, slot: Arc<Slot>, generation: u64, token: CancellationToken) {
        let _permit = tokio::select! {
            _ = token.cancelled() => return,
            permit = self.inner.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let (descriptor, base_bytes) = {
            let state = slot.state.lock().await;
            if !state.owned_by(generation) {
                return;
            }
            (state.transfer.descriptor.clone(), state.transfer.bytes_transferred)
        };
        let meter = Throughput::start(base_bytes);

        match self
            .transfer_payload(&slot, &descriptor, generation, &token, &meter)
            .await
        {
            Ok(true) => self.complete(&slot, &descriptor, generation).await,
            Ok(false) => {
                tracing::debug!(model_id = %descriptor.id, "Transfer worker stopped");
            }
            Err(err) => self.fail(&slot, generation, err).await,
        }
    }

    /// Fetch every payload file; returns false if stopped before the end
    async fn transfer_payload(
        &self,
        slot: &Slot,
        descriptor: &ArtifactDescriptor,
        generation: u64,
        token: &CancellationToken,
        meter: &Throughput,
    ) -> ManagerResult<bool> {
        let id = &descriptor.id;
        let files = &self.inner.files;
        let fs = files.fs();
        let transport = |e: anyhow::Error| ManagerError::TransportFailure {
            id: id.clone(),
            reason: format!("{:#}", e),
        };

        let dir = files.prepare(id).await.map_err(transport)?;
        let mut completed_bytes = 0u64;

        for file in descriptor.payload_files() {
            if token.is_cancelled() {
                return Ok(false);
            }

            let target = dir.join(&file.name);
            if fs.exists(&target).await {
                completed_bytes += fs.stat(&target).await.map_err(transport)?.len;
                continue;
            }

            let part = partial_path(&target);
            let mut offset = if fs.exists(&part).await {
                fs.stat(&part).await.map_err(transport)?.len
            } else {
                0
            };

            if offset > 0 && !self.inner.fetcher.supports_range() {
                tracing::warn!(
                    model_id = %id,
                    file = %file.name,
                    discarded_bytes = offset,
                    "Source cannot serve ranges, restarting file from zero"
                );
                fs.remove(&part).await.map_err(transport)?;
                offset = 0;
                self.emit(TransferEvent::Restarted {
                    id: id.clone(),
                    file: file.name.clone(),
                });
            }

            let (tx, mut rx) = mpsc::unbounded_channel();
            let request = FetchRequest {
                url: file.url.clone(),
                dest: part.clone(),
                offset,
            };
            let fetch = self.inner.fetcher.fetch(request, tx, token.clone());
            tokio::pin!(fetch);

            let result = loop {
                tokio::select! {
                    result = &mut fetch => break result,
                    Some(chunk) = rx.recv() => {
                        self.on_chunk(slot, generation, completed_bytes + chunk.bytes_so_far, meter)
                            .await;
                    }
                }
            };
            while let Ok(chunk) = rx.try_recv() {
                self.on_chunk(slot, generation, completed_bytes + chunk.bytes_so_far, meter)
                    .await;
            }

            let outcome = result.map_err(transport)?;
            if outcome.restarted {
                self.emit(TransferEvent::Restarted {
                    id: id.clone(),
                    file: file.name.clone(),
                });
            }
            if outcome.stopped {
                return Ok(false);
            }

            fs.rename(&part, &target).await.map_err(transport)?;
            completed_bytes += outcome.bytes;
            tracing::debug!(
                model_id = %id,
                file = %file.name,
                bytes = outcome.bytes,
                "Payload file fetched"
            );
        }

        Ok(!token.is_cancelled())
    }

    async fn on_chunk(&self, slot: &Slot, generation: u64, bytes: u64, meter: &Throughput) {
        let mut state = slot.state.lock().await;
        if !state.owned_by(generation) {
            return;
        }

        state.bytes_per_sec = meter.rate(bytes);
        if !state.transfer.record_progress(bytes) {
            return;
        }

        let percent = state.transfer.progress.floor() as u64;
        if percent > state.persisted_percent {
            state.persisted_percent = percent;
            if let Err(e) = self.persist(&state.transfer).await {
                tracing::warn!(
                    model_id = %state.transfer.id,
                    error = %e,
                    "Failed to persist progress"
                );
            }
        }

        self.emit(TransferEvent::Progress(state.snapshot()));
    }

    async fn complete(&self, slot: &Slot, descriptor: &ArtifactDescriptor, generation: u64) {
        let id = &descriptor.id;
        let files = &self.inner.files;

        if let Err(err) = files
            .verify_payload(descriptor, self.inner.settings.integrity_tolerance)
            .await
        {
            return self.fail(slot, generation, err).await;
        }

        let dir = files.dir_for(id);
        let size = match files.path_size(&dir).await {
            Ok(size) => size,
            Err(e) => return self.fail(slot, generation, e.into()).await,
        };

        {
            let mut state = slot.state.lock().await;
            if !state.owned_by(generation) {
                return;
            }

            let installed = InstalledArtifact {
                descriptor: descriptor.clone(),
                installed_at: Utc::now(),
                local_path: dir.clone(),
                size_on_disk_bytes: size,
                compressed: false,
                compressed_at: None,
            };
            if let Err(e) = files.write_metadata(&installed).await {
                return self.fail_locked(&mut state, e.into()).await;
            }

            let mut next = state.transfer.clone();
            next.local_path = Some(dir);
            next.bytes_transferred = next.total_bytes.max(next.bytes_transferred);
            next.progress = 100.0;
            next.set_status(TransferStatus::Completed);
            if let Err(e) = self.persist(&next).await {
                tracing::error!(
                    model_id = %id,
                    error = %e,
                    "Installed artifact but failed to persist completion"
                );
            }
            state.transfer = next;
            state.worker = None;
            state.bytes_per_sec = 0.0;

            self.emit(TransferEvent::Progress(state.snapshot()));
            self.emit(TransferEvent::StatusChanged {
                id: id.clone(),
                status: TransferStatus::Completed,
            });
        }

        metrics::record_download_completed(id, size);
        tracing::info!(model_id = %id, bytes = size, "Artifact installed");

        self.inner.analytics.recompute().await;
    }

    async fn fail(&self, slot: &Slot, generation: u64, err: ManagerError) {
        let mut state = slot.state.lock().await;
        if !state.owned_by(generation) {
            tracing::debug!(error = %err, "Ignoring error from superseded worker");
            return;
        }
        self.fail_locked(&mut state, err).await;
    }

    async fn fail_locked(&self, state: &mut SlotState, err: ManagerError) {
        let id = state.transfer.id.clone();

        if let Err(e) = self.inner.files.remove_artifact(&id).await {
            tracing::warn!(model_id = %id, error = %e, "Failed to remove partial payload");
        }

        let failure = TransferFailure::from(&err);
        let kind = match failure.kind {
            FailureKind::Transport => "transport",
            FailureKind::Integrity => "integrity",
        };
        state.transfer.last_error = Some(failure);
        state.transfer.set_status(TransferStatus::Failed);
        state.worker = None;
        state.bytes_per_sec = 0.0;

        if let Err(e) = self.persist(&state.transfer).await {
            tracing::warn!(model_id = %id, error = %e, "Failed to persist failed state");
        }

        self.emit(TransferEvent::StatusChanged {
            id: id.clone(),
            status: TransferStatus::Failed,
        });
        metrics::record_download_failed(&id, kind);
        tracing::error!(model_id = %id, kind, error = %err, "Transfer failed");
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn slot(&self, id: &str) -> ManagerResult<Arc<Slot>> {
        self.inner
            .slots
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound { id: id.to_string() })
    }

    /// Persist then commit a status change
    async fn transition(&self, state: &mut SlotState, status: TransferStatus) -> ManagerResult<()> {
        let mut next = state.transfer.clone();
        next.set_status(status);
        self.persist(&next).await?;
        state.transfer = next;

        self.emit(TransferEvent::StatusChanged {
            id: state.transfer.id.clone(),
            status,
        });
        Ok(())
    }

    async fn persist(&self, transfer: &TransferState) -> ManagerResult<()> {
        self.inner
            .records
            .set(&download_state_key(&transfer.id), transfer)
            .await?;
        Ok(())
    }

    async fn check_free_space(&self, required: u64) -> ManagerResult<()> {
        let available = self.inner.files.free_space().await?;
        if required > available {
            return Err(ManagerError::InsufficientStorage {
                required,
                available,
            });
        }
        Ok(())
    }

    fn emit(&self, event: TransferEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }
}

async fn join_worker(id: &str, worker: Worker) {
    if let Err(e) = worker.handle.await
        && e.is_panic()
    {
        tracing::error!(model_id = %id, "Transfer worker panicked");
    }
}
