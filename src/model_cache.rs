use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::errors::{InpaintError, Result};
use crate::model_source::{FsModelStore, HttpModelSource, ModelRegistry};
use crate::traits::{ModelSource, ModelStore};

const PROGRESS_CAPACITY: usize = 128;

/// Model bytes shared by every caller that asked for the same name.
#[derive(Clone)]
pub struct ModelBlob {
    name: Arc<str>,
    bytes: Arc<[u8]>,
}

impl ModelBlob {
    pub fn new(name: &str, bytes: Vec<u8>) -> Self {
        Self {
            name: Arc::from(name),
            bytes: Arc::from(bytes),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// True when both handles point at the same allocation.
    pub fn shares_storage(&self, other: &ModelBlob) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

impl fmt::Debug for ModelBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelBlob")
            .field("name", &self.name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// One step of a model download. `percent == 100` means the model is ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadProgress {
    pub model: String,
    pub percent: u8,
}

/// Publishes monotonically increasing percentages for one model transfer.
pub struct ProgressReporter {
    model: Arc<str>,
    sender: broadcast::Sender<DownloadProgress>,
    last: Mutex<Option<u8>>,
}

impl ProgressReporter {
    pub fn new(model: &str, sender: broadcast::Sender<DownloadProgress>) -> Self {
        Self {
            model: Arc::from(model),
            sender,
            last: Mutex::new(None),
        }
    }

    /// A reporter nobody listens to.
    pub fn detached(model: &str) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self::new(model, sender)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Reports `received` of `total` bytes. Unknown totals report nothing.
    ///
    /// Capped at 99 so that 100 stays reserved for "persisted and ready".
    pub fn advance(&self, received: u64, total: Option<u64>) {
        let Some(total) = total.filter(|&t| t > 0) else {
            return;
        };
        let percent = (received.saturating_mul(100) / total).min(99) as u8;
        self.publish(percent);
    }

    pub(crate) fn start(&self) {
        self.publish(0);
    }

    pub(crate) fn complete(&self) {
        self.publish(100);
    }

    fn publish(&self, percent: u8) {
        let mut last = self.last.lock();
        if last.is_some_and(|previous| previous >= percent) {
            return;
        }
        *last = Some(percent);
        // No subscribers is fine.
        let _ = self.sender.send(DownloadProgress {
            model: self.model.to_string(),
            percent,
        });
    }
}

/// Lifecycle of one named model inside a [`ModelCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelState {
    Uninitialized,
    Loading,
    Ready,
    /// The last transfer failed; the next `ensure_model` starts a new one.
    Failed(String),
}

type TransferOutcome = std::result::Result<ModelBlob, Arc<InpaintError>>;
type Transfer = Shared<BoxFuture<'static, TransferOutcome>>;
type Slots = Arc<Mutex<HashMap<String, Slot>>>;

enum Slot {
    Loading(Transfer),
    Ready(ModelBlob),
    Failed(Arc<InpaintError>),
}

/// Process-wide model cache with single-flight transfers per model name.
///
/// A name moves `Uninitialized -> Loading -> Ready`, or to `Failed` when the
/// transfer errors. Callers arriving while a name is `Loading` await the same
/// transfer. Failures are not cached: the next call retries.
pub struct ModelCache {
    source: Arc<dyn ModelSource>,
    store: Arc<dyn ModelStore>,
    slots: Slots,
    progress: broadcast::Sender<DownloadProgress>,
}

impl ModelCache {
    pub fn new(source: Arc<dyn ModelSource>, store: Arc<dyn ModelStore>) -> Self {
        let (progress, _) = broadcast::channel(PROGRESS_CAPACITY);
        Self {
            source,
            store,
            slots: Arc::new(Mutex::new(HashMap::new())),
            progress,
        }
    }

    /// Cache backed by HTTP downloads and a model directory on disk.
    pub fn http(cache_dir: &Path, registry: ModelRegistry) -> Result<Self> {
        let source = HttpModelSource::new(registry)?;
        let store = FsModelStore::new(cache_dir);
        Ok(Self::new(Arc::new(source), Arc::new(store)))
    }

    /// Subscribes to download progress for every model this cache fetches.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadProgress> {
        self.progress.subscribe()
    }

    pub fn state(&self, name: &str) -> ModelState {
        match self.slots.lock().get(name) {
            None => ModelState::Uninitialized,
            Some(Slot::Loading(_)) => ModelState::Loading,
            Some(Slot::Ready(_)) => ModelState::Ready,
            Some(Slot::Failed(err)) => ModelState::Failed(err.to_string()),
        }
    }

    /// Returns the model, downloading and persisting it on first use.
    pub async fn ensure_model(&self, name: &str) -> Result<ModelBlob> {
        let transfer = {
            let mut slots = self.slots.lock();
            match slots.get(name) {
                Some(Slot::Ready(blob)) => {
                    debug!("model `{}` served from memory", name);
                    return Ok(blob.clone());
                }
                Some(Slot::Loading(transfer)) => {
                    debug!("joining in-flight transfer for `{}`", name);
                    transfer.clone()
                }
                Some(Slot::Failed(_)) | None => {
                    let transfer = self.spawn_transfer(name);
                    slots.insert(name.to_string(), Slot::Loading(transfer.clone()));
                    transfer
                }
            }
        };

        transfer
            .await
            .map_err(|err| InpaintError::model_unavailable(name, "awaiting model transfer", err))
    }

    fn spawn_transfer(&self, name: &str) -> Transfer {
        let task = tokio::spawn(transfer(
            name.to_string(),
            Arc::clone(&self.source),
            Arc::clone(&self.store),
            Arc::clone(&self.slots),
            ProgressReporter::new(name, self.progress.clone()),
        ));

        let name = name.to_string();
        let slots = Arc::clone(&self.slots);
        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    let err = Arc::new(InpaintError::model_unavailable(
                        &name,
                        "model transfer task",
                        join_err,
                    ));
                    slots.lock().insert(name, Slot::Failed(Arc::clone(&err)));
                    Err(err)
                }
            }
        }
        .boxed()
        .shared()
    }
}

async fn transfer(
    name: String,
    source: Arc<dyn ModelSource>,
    store: Arc<dyn ModelStore>,
    slots: Slots,
    progress: ProgressReporter,
) -> TransferOutcome {
    let outcome = acquire(&name, source.as_ref(), store.as_ref(), &progress).await;

    let mut slots = slots.lock();
    match outcome {
        Ok(blob) => {
            slots.insert(name, Slot::Ready(blob.clone()));
            Ok(blob)
        }
        Err(err) => {
            warn!("model `{}` unavailable: {}", name, err);
            let err = Arc::new(err);
            slots.insert(name, Slot::Failed(Arc::clone(&err)));
            Err(err)
        }
    }
}

async fn acquire(
    name: &str,
    source: &dyn ModelSource,
    store: &dyn ModelStore,
    progress: &ProgressReporter,
) -> Result<ModelBlob> {
    if let Some(bytes) = store.load(name).await? {
        info!("model `{}` loaded from local store ({} bytes)", name, bytes.len());
        progress.complete();
        return Ok(ModelBlob::new(name, bytes));
    }

    info!("downloading model `{}`", name);
    let started = Instant::now();
    progress.start();
    let bytes = source.fetch(name, progress).await?;
    if bytes.is_empty() {
        return Err(InpaintError::model_unavailable(
            name,
            "model download",
            "received an empty payload",
        ));
    }

    store.save(name, &bytes).await?;
    info!(
        "model `{}` downloaded and persisted ({} bytes in {:?})",
        name,
        bytes.len(),
        started.elapsed()
    );
    progress.complete();
    Ok(ModelBlob::new(name, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_monotonic_and_capped_before_completion() {
        let (sender, mut receiver) = broadcast::channel(16);
        let reporter = ProgressReporter::new("inpaint", sender);

        reporter.start();
        reporter.advance(50, Some(100));
        reporter.advance(10, Some(100));
        reporter.advance(100, Some(100));
        reporter.advance(100, None);
        reporter.complete();

        let mut seen = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            assert_eq!(event.model, "inpaint");
            seen.push(event.percent);
        }
        assert_eq!(seen, vec![0, 50, 99, 100]);
    }

    #[test]
    fn blob_clones_share_storage() {
        let blob = ModelBlob::new("inpaint", vec![1, 2, 3]);
        let other = blob.clone();
        assert!(blob.shares_storage(&other));
        assert_eq!(other.as_bytes(), &[1, 2, 3]);
        assert_eq!(format!("{:?}", blob), "ModelBlob { name: \"inpaint\", len: 3 }");
    }
}
