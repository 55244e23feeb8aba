//! Single-flight decrypt → load → erase pipeline with a bounded model cache.
//!
//! Each `(reference, format)` pair owns one `tokio::sync::OnceCell` slot in a
//! mutex-guarded map. Lookup and slot insertion happen under the mutex, so
//! concurrent callers for the same pair share one in-flight load. A failed
//! load leaves the cell empty; callers that were waiting retry one at a time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::OnceCell;
use tokio::time::Instant;

use crate::envelope::batch::BatchSummary;
use crate::envelope::{metadata_path_for, EncryptionMetadata, EnvelopeCryptoEngine};
use crate::error::{Result, VaultError};
use crate::lock::lock;
use crate::model::format::{ModelFormat, ModelFormatLoader, PlaintextArtifact};
use crate::model::scratch::ScratchDir;
use crate::tee::detect::EnvironmentProbe;
use crate::tee::gate::KeyReleaseGate;

/// Cache retention bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionBounds {
    /// Maximum cached models; the least recently used is evicted. 0 = unbounded.
    pub max_models: usize,
    /// Evict entries idle longer than this. `None` = never.
    pub idle_ttl: Option<Duration>,
}

/// A fully loaded model. Only ever inserted after decrypt, verify and load succeed.
pub struct ModelRecord<H> {
    pub cache_key: String,
    pub format: ModelFormat,
    pub artifact_name: String,
    pub plaintext_length: u64,
    pub loaded_at: chrono::DateTime<chrono::Utc>,
    pub handle: Arc<H>,
}

struct Slot<H> {
    cell: Arc<OnceCell<Arc<ModelRecord<H>>>>,
    last_access: Instant,
}

impl<H> Slot<H> {
    fn new() -> Self {
        Self {
            cell: Arc::new(OnceCell::new()),
            last_access: Instant::now(),
        }
    }

    /// No record and nobody holding the cell.
    fn is_abandoned(&self) -> bool {
        !self.cell.initialized() && Arc::strong_count(&self.cell) == 1
    }
}

type CacheKey = (String, ModelFormat);

/// Summary of a cached model.
#[derive(Debug, Clone, Serialize)]
pub struct LoadedModel {
    pub cache_key: String,
    pub format: ModelFormat,
    pub artifact_name: String,
    pub plaintext_length: u64,
    pub loaded_at: chrono::DateTime<chrono::Utc>,
    pub idle_secs: u64,
}

/// Metadata-only view of an encrypted artifact.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub path: PathBuf,
    pub metadata_path: PathBuf,
    pub artifact_name: String,
    pub algorithm: String,
    pub custodian_key_ref: String,
    pub plaintext_length: u64,
    pub ciphertext_length: u64,
    pub plaintext_digest: String,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Metadata summary of the artifact at `reference`. Touches neither the
/// custodian nor attestation.
pub fn read_model_info(reference: &Path) -> Result<ModelInfo> {
    let metadata_path = metadata_path_for(reference);
    let metadata = EncryptionMetadata::load(&metadata_path)?;
    Ok(ModelInfo {
        path: reference.to_path_buf(),
        metadata_path,
        artifact_name: metadata.artifact_name,
        algorithm: metadata.algorithm,
        custodian_key_ref: metadata.custodian_key_ref,
        plaintext_length: metadata.plaintext_length,
        ciphertext_length: metadata.ciphertext_length,
        plaintext_digest: metadata.plaintext_digest,
        created_at: metadata.created_at,
    })
}

pub struct ModelMaterializer<L: ModelFormatLoader> {
    engine: Arc<EnvelopeCryptoEngine>,
    gate: Arc<KeyReleaseGate>,
    probe: Arc<dyn EnvironmentProbe>,
    loader: Arc<L>,
    scratch: ScratchDir,
    artifact_dir: PathBuf,
    bounds: RetentionBounds,
    cache: Mutex<HashMap<CacheKey, Slot<L::Handle>>>,
}

impl<L: ModelFormatLoader> std::fmt::Debug for ModelMaterializer<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelMaterializer")
            .field("scratch", &self.scratch)
            .field("artifact_dir", &self.artifact_dir)
            .field("bounds", &self.bounds)
            .field("cached", &self.len())
            .finish()
    }
}

fn cache_key_string(reference: &Path, format: ModelFormat) -> String {
    format!("{}:{}", reference.display(), format)
}

impl<L: ModelFormatLoader> ModelMaterializer<L> {
    pub fn new(
        engine: Arc<EnvelopeCryptoEngine>,
        gate: Arc<KeyReleaseGate>,
        probe: Arc<dyn EnvironmentProbe>,
        loader: Arc<L>,
        scratch: ScratchDir,
    ) -> Self {
        Self {
            engine,
            gate,
            probe,
            loader,
            scratch,
            artifact_dir: PathBuf::from("/models"),
            bounds: RetentionBounds::default(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_bounds(mut self, bounds: RetentionBounds) -> Self {
        self.bounds = bounds;
        self
    }

    /// Directory resolved by [`Self::materialize_from_storage`].
    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = dir.into();
        self
    }

    pub fn scratch_dir(&self) -> &ScratchDir {
        &self.scratch
    }

    /// Return the loaded handle for `reference`, decrypting and loading it
    /// on a cache miss.
    ///
    /// A hit touches neither disk, custodian nor attestation. On a miss the
    /// plaintext passes through a scratch file that is erased before this
    /// returns, whatever the outcome. Nothing is cached on failure.
    pub async fn materialize(&self, reference: &Path, format: ModelFormat) -> Result<Arc<L::Handle>> {
        self.evict_idle();

        let key: CacheKey = (reference.display().to_string(), format);
        let cell = {
            let mut cache = lock(&self.cache);
            let slot = cache.entry(key.clone()).or_insert_with(Slot::new);
            slot.last_access = Instant::now();
            Arc::clone(&slot.cell)
        };

        if let Some(record) = cell.get() {
            tracing::debug!(key = %record.cache_key, "Model cache hit");
            return Ok(Arc::clone(&record.handle));
        }

        let result = cell
            .get_or_try_init(|| self.load_uncached(reference, format))
            .await
            .map(|record| Arc::clone(&record.handle));
        drop(cell);

        match result {
            Ok(handle) => {
                self.touch(&key);
                self.enforce_capacity(&key);
                Ok(handle)
            }
            Err(e) => {
                self.discard_abandoned(&key);
                tracing::warn!(artifact = %reference.display(), %format, error = %e, "Materialize failed");
                Err(e)
            }
        }
    }

    async fn load_uncached(
        &self,
        reference: &Path,
        format: ModelFormat,
    ) -> Result<Arc<ModelRecord<L::Handle>>> {
        let cache_key = cache_key_string(reference, format);
        tracing::info!(key = %cache_key, "Materializing model");

        let metadata = EncryptionMetadata::load(&metadata_path_for(reference))?;
        let ciphertext = tokio::fs::read(reference).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VaultError::NotFound(format!("encrypted artifact {}", reference.display()))
            } else {
                VaultError::Io(e)
            }
        })?;

        let verdict = self.gate.authorize(self.probe.as_ref()).await?;
        let plaintext = self
            .engine
            .decrypt(&ciphertext, &metadata, &self.gate, &verdict)
            .await?;
        drop(ciphertext);

        let scratch = self.scratch.write(&plaintext)?;
        let scratch_path = scratch.path().to_path_buf();
        let loader = Arc::clone(&self.loader);
        let name = metadata.artifact_name.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let artifact = PlaintextArtifact {
                name: &name,
                bytes: &plaintext,
                path: &scratch_path,
            };
            loader.load(format, &artifact)
        })
        .await
        .map_err(|e| {
            VaultError::Corrupt(format!(
                "format loader for '{}' aborted: {e}",
                metadata.artifact_name
            ))
        })??;
        drop(scratch);

        tracing::info!(key = %cache_key, bytes = metadata.plaintext_length, "Model materialized");
        Ok(Arc::new(ModelRecord {
            cache_key,
            format,
            artifact_name: metadata.artifact_name,
            plaintext_length: metadata.plaintext_length,
            loaded_at: chrono::Utc::now(),
            handle: Arc::new(handle),
        }))
    }

    /// Materialize `<artifact_dir>/<model_id>.encrypted`.
    pub async fn materialize_from_storage(
        &self,
        model_id: &str,
        format: ModelFormat,
    ) -> Result<Arc<L::Handle>> {
        let path = self.artifact_dir.join(format!("{model_id}.encrypted"));
        if !path.exists() {
            return Err(VaultError::NotFound(format!(
                "model '{model_id}' not found in {}",
                self.artifact_dir.display()
            )));
        }
        self.materialize(&path, format).await
    }

    /// Materialize each request in turn. One failure never stops the rest.
    pub async fn preload(&self, requests: &[(PathBuf, ModelFormat)]) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for (reference, format) in requests {
            let key = cache_key_string(reference, *format);
            match self.materialize(reference, *format).await {
                Ok(_) => summary.record_success(key, None),
                Err(e) => summary.record_failure(key, e),
            }
        }
        tracing::info!(
            total = summary.total,
            successful = summary.successful,
            failed = summary.failed,
            "Preload finished"
        );
        summary
    }

    /// Read an artifact's metadata without decrypting anything.
    pub fn model_info(&self, reference: &Path) -> Result<ModelInfo> {
        read_model_info(reference)
    }

    /// Drop every cached format of `reference`. Returns whether anything was removed.
    pub fn unload(&self, reference: &Path) -> bool {
        let reference = reference.display().to_string();
        let removed: Vec<_> = {
            let mut cache = lock(&self.cache);
            let keys: Vec<CacheKey> = cache
                .iter()
                .filter(|(key, slot)| key.0 == reference && slot.cell.initialized())
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter().filter_map(|k| cache.remove(&k)).collect()
        };
        if !removed.is_empty() {
            tracing::info!(artifact = %reference, count = removed.len(), "Model unloaded");
        }
        !removed.is_empty()
    }

    /// Release every loaded model and erase leftover scratch files. Safe to
    /// call repeatedly.
    ///
    /// Loads still in flight keep their slot, so later callers for the same
    /// key keep waiting on them; they land in the cache when they finish.
    /// Their scratch files are erased by their own guards.
    pub fn cleanup(&self) -> Result<usize> {
        let (drained, in_flight): (Vec<_>, usize) = {
            let mut cache = lock(&self.cache);
            let keys: Vec<CacheKey> = cache
                .iter()
                .filter(|(_, slot)| slot.cell.initialized() || slot.is_abandoned())
                .map(|(key, _)| key.clone())
                .collect();
            let drained = keys.into_iter().filter_map(|k| cache.remove(&k)).collect();
            (drained, cache.len())
        };
        let released = drained.iter().filter(|slot| slot.cell.initialized()).count();
        drop(drained);

        let erased = self.scratch.purge()?;
        tracing::info!(released, in_flight, erased, "Model cache cleaned up");
        Ok(released)
    }

    /// Evict entries idle longer than the TTL. Returns how many were evicted.
    pub fn evict_idle(&self) -> usize {
        let Some(ttl) = self.bounds.idle_ttl else {
            return 0;
        };
        let now = Instant::now();
        let evicted: Vec<_> = {
            let mut cache = lock(&self.cache);
            let keys: Vec<CacheKey> = cache
                .iter()
                .filter(|(_, slot)| {
                    (slot.cell.initialized() && now.duration_since(slot.last_access) > ttl)
                        || slot.is_abandoned()
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| cache.remove(&k).map(|slot| (k, slot)))
                .collect()
        };

        let count = evicted
            .iter()
            .filter(|(_, slot)| slot.cell.initialized())
            .count();
        for (key, slot) in &evicted {
            if slot.cell.initialized() {
                tracing::info!(artifact = %key.0, format = %key.1, "Evicted idle model");
            }
        }
        count
    }

    fn enforce_capacity(&self, just_loaded: &CacheKey) {
        let max = self.bounds.max_models;
        if max == 0 {
            return;
        }
        let evicted: Vec<_> = {
            let mut cache = lock(&self.cache);
            let mut evicted = Vec::new();
            loop {
                let loaded = cache.values().filter(|s| s.cell.initialized()).count();
                if loaded <= max {
                    break;
                }
                let victim = cache
                    .iter()
                    .filter(|(key, slot)| *key != just_loaded && slot.cell.initialized())
                    .min_by_key(|(_, slot)| slot.last_access)
                    .map(|(key, _)| key.clone());
                match victim {
                    Some(key) => {
                        if let Some(slot) = cache.remove(&key) {
                            evicted.push((key, slot));
                        }
                    }
                    None => break,
                }
            }
            evicted
        };
        for (key, _) in &evicted {
            tracing::info!(artifact = %key.0, format = %key.1, max, "Evicted least recently used model");
        }
    }

    fn touch(&self, key: &CacheKey) {
        if let Some(slot) = lock(&self.cache).get_mut(key) {
            slot.last_access = Instant::now();
        }
    }

    fn discard_abandoned(&self, key: &CacheKey) {
        let mut cache = lock(&self.cache);
        if cache.get(key).is_some_and(Slot::is_abandoned) {
            cache.remove(key);
        }
    }

    /// Currently cached models.
    pub fn loaded(&self) -> Vec<LoadedModel> {
        let now = Instant::now();
        let cache = lock(&self.cache);
        let mut models: Vec<LoadedModel> = cache
            .values()
            .filter_map(|slot| {
                slot.cell.get().map(|record| LoadedModel {
                    cache_key: record.cache_key.clone(),
                    format: record.format,
                    artifact_name: record.artifact_name.clone(),
                    plaintext_length: record.plaintext_length,
                    loaded_at: record.loaded_at,
                    idle_secs: now.duration_since(slot.last_access).as_secs(),
                })
            })
            .collect();
        models.sort_by(|a, b| a.cache_key.cmp(&b.cache_key));
        models
    }

    pub fn len(&self) -> usize {
        lock(&self.cache)
            .values()
            .filter(|s| s.cell.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tee::attestation::{EnvironmentKind, SimulatedAttestationService, TcbLevel};
    use crate::tee::detect::StaticProbe;
    use crate::tee::policy::PolicyDocument;
    use crate::test_utils::{CountingCustodian, RecordingLoader};

    struct Fixture {
        _dir: tempfile::TempDir,
        models: PathBuf,
        custodian: Arc<CountingCustodian>,
        engine: Arc<EnvelopeCryptoEngine>,
        materializer: ModelMaterializer<RecordingLoader>,
        loader: Arc<RecordingLoader>,
    }

    fn fixture_with(probe: StaticProbe, loader: RecordingLoader, bounds: RetentionBounds) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let models = dir.path().join("models");
        std::fs::create_dir_all(&models).unwrap();
        let custodian = Arc::new(CountingCustodian::new("wrap-key"));
        let engine = Arc::new(EnvelopeCryptoEngine::new(custodian.clone()));
        let gate = Arc::new(
            KeyReleaseGate::new(
                PolicyDocument::permissive(),
                Arc::new(SimulatedAttestationService::new(
                    Default::default(),
                    TcbLevel::UpToDate,
                )),
            )
            .with_custodian(custodian.clone()),
        );
        let loader = Arc::new(loader);
        let scratch = ScratchDir::create(dir.path().join("scratch")).unwrap();
        let materializer = ModelMaterializer::new(
            engine.clone(),
            gate,
            Arc::new(probe),
            loader.clone(),
            scratch,
        )
        .with_bounds(bounds)
        .with_artifact_dir(&models);
        Fixture {
            _dir: dir,
            models,
            custodian,
            engine,
            materializer,
            loader,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            StaticProbe::for_environment(EnvironmentKind::Sgx),
            RecordingLoader::new(),
            RetentionBounds::default(),
        )
    }

    async fn encrypt_model(f: &Fixture, name: &str, body: &[u8]) -> PathBuf {
        let plain = f.models.join(name);
        std::fs::write(&plain, body).unwrap();
        let encrypted = f.models.join(format!("{name}.encrypted"));
        f.engine
            .encrypt_file(&plain, &encrypted, None, "wrap-key")
            .await
            .unwrap();
        std::fs::remove_file(&plain).unwrap();
        encrypted
    }

    #[tokio::test]
    async fn test_materialize_and_cache_hit() {
        let f = fixture();
        let path = encrypt_model(&f, "a.pt", b"weights-a").await;

        let first = f.materializer.materialize(&path, ModelFormat::Raw).await.unwrap();
        assert_eq!(first.bytes, b"weights-a");
        assert_eq!(f.custodian.unwrap_calls(), 1);

        std::fs::remove_file(&path).unwrap();
        let second = f.materializer.materialize(&path, ModelFormat::Raw).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(f.custodian.unwrap_calls(), 1);
        assert_eq!(f.loader.load_calls(), 1);
        assert_eq!(f.materializer.len(), 1);
    }

    #[tokio::test]
    async fn test_scratch_erased_after_success_and_loader_saw_file() {
        let f = fixture();
        let path = encrypt_model(&f, "a.pt", b"weights").await;
        f.materializer.materialize(&path, ModelFormat::Raw).await.unwrap();
        assert!(f.materializer.scratch_dir().files().unwrap().is_empty());
        let seen = f.loader.seen_paths();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].exists());
    }

    #[tokio::test]
    async fn test_loader_failure_caches_nothing_and_erases_scratch() {
        let f = fixture_with(
            StaticProbe::for_environment(EnvironmentKind::Sgx),
            RecordingLoader::failing(),
            RetentionBounds::default(),
        );
        let path = encrypt_model(&f, "a.pt", b"weights").await;
        let err = f
            .materializer
            .materialize(&path, ModelFormat::Raw)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Corrupt(_)));
        assert!(f.materializer.is_empty());
        assert!(f.materializer.scratch_dir().files().unwrap().is_empty());
        assert!(!f.loader.seen_paths()[0].exists());
    }

    #[tokio::test]
    async fn test_rejected_attestation_never_unwraps() {
        let f = fixture_with(StaticProbe::new(), RecordingLoader::new(), RetentionBounds::default());
        let path = encrypt_model(&f, "a.pt", b"weights").await;
        let err = f
            .materializer
            .materialize(&path, ModelFormat::Raw)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::PolicyViolation(_)));
        assert_eq!(f.custodian.unwrap_calls(), 0);
        assert_eq!(f.loader.load_calls(), 0);
        assert!(f.materializer.is_empty());
    }

    #[tokio::test]
    async fn test_missing_artifact_is_not_found() {
        let f = fixture();
        let err = f
            .materializer
            .materialize(&f.models.join("absent.pt.encrypted"), ModelFormat::Raw)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::NotFound(_)));

        let err = f
            .materializer
            .materialize_from_storage("absent.pt", ModelFormat::Raw)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_materialize_from_storage() {
        let f = fixture();
        encrypt_model(&f, "bert.onnx", b"onnx bytes").await;
        let handle = f
            .materializer
            .materialize_from_storage("bert.onnx", ModelFormat::Onnx)
            .await
            .unwrap();
        assert_eq!(handle.bytes, b"onnx bytes");
        assert_eq!(handle.format, ModelFormat::Onnx);
    }

    #[tokio::test]
    async fn test_formats_are_cached_separately() {
        let f = fixture();
        let path = encrypt_model(&f, "a.pt", b"weights").await;
        f.materializer.materialize(&path, ModelFormat::Raw).await.unwrap();
        f.materializer.materialize(&path, ModelFormat::Pytorch).await.unwrap();
        assert_eq!(f.materializer.len(), 2);
        assert_eq!(f.custodian.unwrap_calls(), 2);

        assert!(f.materializer.unload(&path));
        assert!(f.materializer.is_empty());
        assert!(!f.materializer.unload(&path));
    }

    #[tokio::test]
    async fn test_unload_then_reload_decrypts_again() {
        let f = fixture();
        let path = encrypt_model(&f, "a.pt", b"weights").await;
        f.materializer.materialize(&path, ModelFormat::Raw).await.unwrap();
        f.materializer.unload(&path);
        f.materializer.materialize(&path, ModelFormat::Raw).await.unwrap();
        assert_eq!(f.custodian.unwrap_calls(), 2);
    }

    #[tokio::test]
    async fn test_lru_capacity_bound() {
        let f = fixture_with(
            StaticProbe::for_environment(EnvironmentKind::Sgx),
            RecordingLoader::new(),
            RetentionBounds {
                max_models: 2,
                idle_ttl: None,
            },
        );
        let a = encrypt_model(&f, "a.pt", b"a").await;
        let b = encrypt_model(&f, "b.pt", b"b").await;
        let c = encrypt_model(&f, "c.pt", b"c").await;

        f.materializer.materialize(&a, ModelFormat::Raw).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        f.materializer.materialize(&b, ModelFormat::Raw).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        // touch a so b becomes least recently used
        f.materializer.materialize(&a, ModelFormat::Raw).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        f.materializer.materialize(&c, ModelFormat::Raw).await.unwrap();

        let keys: Vec<String> = f
            .materializer
            .loaded()
            .into_iter()
            .map(|m| m.artifact_name)
            .collect();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&"a.pt".to_string()));
        assert!(keys.contains(&"c.pt".to_string()));
    }

    #[tokio::test]
    async fn test_idle_ttl_eviction() {
        let f = fixture_with(
            StaticProbe::for_environment(EnvironmentKind::Sgx),
            RecordingLoader::new(),
            RetentionBounds {
                max_models: 0,
                idle_ttl: Some(Duration::from_millis(500)),
            },
        );
        let path = encrypt_model(&f, "a.pt", b"a").await;
        f.materializer.materialize(&path, ModelFormat::Raw).await.unwrap();
        assert_eq!(f.materializer.evict_idle(), 0);

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(f.materializer.evict_idle(), 1);
        assert!(f.materializer.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let f = fixture();
        let path = encrypt_model(&f, "a.pt", b"a").await;
        f.materializer.materialize(&path, ModelFormat::Raw).await.unwrap();
        std::fs::write(f.materializer.scratch_dir().path().join("stale.plain"), b"leak").unwrap();

        assert_eq!(f.materializer.cleanup().unwrap(), 1);
        assert!(f.materializer.is_empty());
        assert!(f.materializer.scratch_dir().files().unwrap().is_empty());
        assert_eq!(f.materializer.cleanup().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_preload_isolates_failures() {
        let f = fixture();
        let a = encrypt_model(&f, "a.pt", b"a").await;
        let missing = f.models.join("missing.pt.encrypted");
        let b = encrypt_model(&f, "b.pt", b"b").await;

        let summary = f
            .materializer
            .preload(&[
                (a, ModelFormat::Raw),
                (missing, ModelFormat::Raw),
                (b, ModelFormat::Raw),
            ])
            .await;
        assert_eq!(summary.total, 3);
        assert_eq!(summary.successful, 2);
        assert_eq!(summary.failed, 1);
        assert!(summary.details[1].error.as_deref().unwrap().contains("Not found"));
        assert_eq!(f.materializer.len(), 2);
    }

    #[tokio::test]
    async fn test_model_info_reads_metadata_only() {
        let f = fixture();
        let path = encrypt_model(&f, "a.pt", b"twelve bytes").await;
        let info = f.materializer.model_info(&path).unwrap();
        assert_eq!(info.artifact_name, "a.pt");
        assert_eq!(info.plaintext_length, 12);
        assert_eq!(info.ciphertext_length, 16);
        assert_eq!(info.algorithm, "AES-256-CBC");
        assert_eq!(f.custodian.unwrap_calls(), 0);
    }
}
