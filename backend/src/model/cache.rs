use shared::ModelInfoResponse;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Mutex, OnceCell};

use super::loader::{ModelError, ModelHandle, ModelLoader};

type Slot = Arc<OnceCell<Arc<ModelHandle>>>;

/// Process-wide holder for the loaded model.
///
/// The first `get` performs the load; callers arriving while it runs wait on
/// the same `OnceCell` instead of loading again. Once filled, `get` only
/// clones an `Arc`, so a slow inference never blocks loading or reloading.
/// `reload` and `switch` build a new handle off to the side and swap it in;
/// requests already holding the old handle finish with it.
pub struct ModelCache {
    loader: Arc<dyn ModelLoader>,
    slot: RwLock<Slot>,
    /// Artifact chosen by the last successful `switch`; `None` is the default.
    active: RwLock<Option<String>>,
    reload_lock: Mutex<()>,
}

impl ModelCache {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            slot: RwLock::new(Arc::new(OnceCell::new())),
            active: RwLock::new(None),
            reload_lock: Mutex::new(()),
        }
    }

    fn current(&self) -> Slot {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn active_artifact(&self) -> Option<String> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn get(&self) -> Result<Arc<ModelHandle>, ModelError> {
        let slot = self.current();
        let loader = self.loader.clone();
        let artifact = self.active_artifact();
        slot.get_or_try_init(|| load_off_thread(loader, artifact))
            .await
            .cloned()
    }

    /// The loaded handle, without triggering a load.
    pub fn loaded(&self) -> Option<Arc<ModelHandle>> {
        self.current().get().cloned()
    }

    /// Loads the active artifact again and swaps it in.
    pub async fn reload(&self) -> Result<Arc<ModelHandle>, ModelError> {
        let _guard = self.reload_lock.lock().await;
        log::info!("Reloading classification model");
        self.swap_in(self.active_artifact()).await
    }

    /// Loads the named artifact and makes it the active one. On failure the
    /// current model stays in place.
    pub async fn switch(&self, artifact: &str) -> Result<Arc<ModelHandle>, ModelError> {
        let _guard = self.reload_lock.lock().await;
        log::info!("Switching classification model to {}", artifact);
        let handle = self.swap_in(Some(artifact.to_string())).await?;
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = Some(artifact.to_string());
        Ok(handle)
    }

    async fn swap_in(&self, artifact: Option<String>) -> Result<Arc<ModelHandle>, ModelError> {
        let handle = load_off_thread(self.loader.clone(), artifact).await?;
        let fresh = Arc::new(OnceCell::new_with(Some(handle.clone())));
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        log::info!(
            "Model in service: {} v{} from {}",
            handle.metadata.model_name,
            handle.metadata.version,
            handle.model_path.display()
        );
        Ok(handle)
    }

    pub fn info(&self) -> ModelInfoResponse {
        match self.loaded() {
            Some(handle) => handle.info(),
            None => ModelInfoResponse::default(),
        }
    }
}

async fn load_off_thread(
    loader: Arc<dyn ModelLoader>,
    artifact: Option<String>,
) -> Result<Arc<ModelHandle>, ModelError> {
    let result = tokio::task::spawn_blocking(move || loader.load(artifact.as_deref()))
        .await
        .map_err(|e| ModelError::Unavailable(format!("model loading task failed: {}", e)))?;
    match result {
        Ok(handle) => Ok(Arc::new(handle)),
        Err(e) => {
            log::error!("Failed to load classification model: {}", e);
            Err(e)
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::model::classifier::{Classifier, InferenceError, InputTensor, ModelOutput};
    use crate::model::metadata::ModelMetadata;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Returns fixed logits and counts forward passes.
    pub struct FixedClassifier {
        pub scores: Vec<f32>,
        pub objectness: Option<f32>,
        pub calls: AtomicUsize,
    }

    impl FixedClassifier {
        pub fn new(scores: Vec<f32>) -> Self {
            Self {
                scores,
                objectness: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Classifier for FixedClassifier {
        fn forward(&self, input: &InputTensor) -> Result<ModelOutput, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if input.shape()[1] != 3 {
                return Err(InferenceError::Model("expected 3 channels".to_string()));
            }
            Ok(ModelOutput {
                scores: self.scores.clone(),
                objectness: self.objectness,
            })
        }

        fn device(&self) -> String {
            "Cpu".to_string()
        }
    }

    /// Derives scores from the mean intensity of each channel, so different
    /// images (and flipped views) can score differently.
    pub struct MeanIntensityClassifier;

    impl Classifier for MeanIntensityClassifier {
        fn forward(&self, input: &InputTensor) -> Result<ModelOutput, InferenceError> {
            let left_half = input.shape()[3] / 2;
            let mut scores = vec![0.0f32; 6];
            for c in 0..3 {
                let channel = input.index_axis(ndarray::Axis(1), c);
                scores[c] = channel.mean().unwrap_or(0.0);
                let left = channel.slice(ndarray::s![.., .., ..left_half]);
                scores[c + 3] = left.mean().unwrap_or(0.0);
            }
            Ok(ModelOutput::logits(scores))
        }

        fn device(&self) -> String {
            "Cpu".to_string()
        }
    }

    pub fn handle_with(classifier: Arc<dyn Classifier>) -> Arc<ModelHandle> {
        Arc::new(ModelHandle::new(
            classifier,
            ModelMetadata::default(),
            PathBuf::from("test/plum.pt"),
        ))
    }

    /// Counts loads and takes a while doing each one.
    pub struct CountingLoader {
        pub loads: AtomicUsize,
        pub delay: Duration,
        pub fail: bool,
    }

    impl CountingLoader {
        pub fn new(delay: Duration) -> Self {
            Self {
                loads: AtomicUsize::new(0),
                delay,
                fail: false,
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(Duration::ZERO)
            }
        }
    }

    /// Artifact names other than these are unknown to `CountingLoader`.
    pub const KNOWN_ARTIFACTS: [&str; 2] = ["plum.pt", "plum_v2.pt"];

    impl ModelLoader for CountingLoader {
        fn load(&self, artifact: Option<&str>) -> Result<ModelHandle, ModelError> {
            let file = artifact.unwrap_or("plum.pt");
            if !KNOWN_ARTIFACTS.contains(&file) {
                return Err(ModelError::UnknownArtifact(file.to_string()));
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(ModelError::Unavailable("no artifact".to_string()));
            }
            let mut metadata = ModelMetadata::default();
            metadata.version = format!("load-{}", self.loads.load(Ordering::SeqCst));
            Ok(ModelHandle::new(
                Arc::new(FixedClassifier::new(vec![3.0, 1.0, 0.5, 0.2, 0.1, 0.0])),
                metadata,
                PathBuf::from("test").join(file),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::CountingLoader;
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_use_loads_once() {
        let loader = Arc::new(CountingLoader::new(Duration::from_millis(50)));
        let cache = Arc::new(ModelCache::new(loader.clone()));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get().await.map(|h| h.metadata.version.clone()) })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "load-1");
        }
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handle_is_shared_after_load() {
        let loader = Arc::new(CountingLoader::new(Duration::ZERO));
        let cache = ModelCache::new(loader.clone());
        assert!(cache.loaded().is_none());
        assert!(!cache.info().loaded);

        let first = cache.get().await.unwrap();
        let second = cache.get().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(cache.info().loaded);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_load_is_reported_and_retried() {
        let loader = Arc::new(CountingLoader::failing());
        let cache = ModelCache::new(loader.clone());
        assert!(matches!(cache.get().await, Err(ModelError::Unavailable(_))));
        assert!(matches!(cache.get().await, Err(ModelError::Unavailable(_))));
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
        assert!(cache.loaded().is_none());
    }

    #[tokio::test]
    async fn reload_swaps_handle_and_keeps_old_one_alive() {
        let loader = Arc::new(CountingLoader::new(Duration::ZERO));
        let cache = ModelCache::new(loader.clone());
        let old = cache.get().await.unwrap();
        let new = cache.reload().await.unwrap();

        assert_eq!(old.metadata.version, "load-1");
        assert_eq!(new.metadata.version, "load-2");
        assert!(Arc::ptr_eq(&cache.get().await.unwrap(), &new));
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn switch_replaces_model_and_survives_reload() {
        let loader = Arc::new(CountingLoader::new(Duration::ZERO));
        let cache = ModelCache::new(loader.clone());
        let old = cache.get().await.unwrap();

        let switched = cache.switch("plum_v2.pt").await.unwrap();
        assert_eq!(switched.model_path, PathBuf::from("test/plum_v2.pt"));
        assert_eq!(old.model_path, PathBuf::from("test/plum.pt"));
        assert!(Arc::ptr_eq(&cache.get().await.unwrap(), &switched));

        let reloaded = cache.reload().await.unwrap();
        assert_eq!(reloaded.model_path, PathBuf::from("test/plum_v2.pt"));
        assert_eq!(loader.loads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unknown_artifact_keeps_current_model() {
        let loader = Arc::new(CountingLoader::new(Duration::ZERO));
        let cache = ModelCache::new(loader.clone());
        let current = cache.get().await.unwrap();

        assert!(matches!(
            cache.switch("missing.pt").await,
            Err(ModelError::UnknownArtifact(_))
        ));
        assert!(Arc::ptr_eq(&cache.get().await.unwrap(), &current));
        let reloaded = cache.reload().await.unwrap();
        assert_eq!(reloaded.model_path, PathBuf::from("test/plum.pt"));
    }
}
