//! Model Registry & Scanner: discovers GGUF models, groups shards, assigns
//! stable IDs, persists the catalog, and answers queries.

pub mod catalog;
pub mod metadata;
pub mod scan;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, info, warn};

pub use metadata::ModelMetadata;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model {0} not found")]
    NotFound(String),
    #[error("model {0} already exists")]
    AlreadyExists(String),
    #[error("a scan is already in progress")]
    ScanInProgress,
    #[error("invalid state transition for model {0}: {1}")]
    InvalidState(String, String),
    #[error("model {0} is already loading")]
    AlreadyLoading(String),
    #[error("scan error: {0}")]
    Scan(String),
    #[error("catalog error: {0}")]
    Catalog(String),
    #[error(transparent)]
    Metadata(#[from] metadata::MetadataError),
    #[error(transparent)]
    Supervisor(#[from] crate::supervisor::SupervisorError),
    #[error(transparent)]
    Port(#[from] crate::supervisor::port::PortAllocatorError),
}

/// Runtime load state of one model. `StateSet` = UNLOADED/LOADING/LOADED/
/// UNLOADING/ERROR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelState {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStatus {
    pub state: ModelState,
    #[serde(rename = "processID")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(rename = "loadedAt")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_at: Option<DateTime<Utc>>,
    #[serde(rename = "lastError")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Default for ModelStatus {
    fn default() -> Self {
        Self {
            state: ModelState::Unloaded,
            process_id: None,
            port: None,
            loaded_at: None,
            last_error: None,
        }
    }
}

/// A logical inference artifact: one file, or a merged shard group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub name: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub path: PathBuf,
    #[serde(rename = "pathPrefix")]
    pub path_prefix: String,
    pub size: u64,
    #[serde(rename = "totalSize")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
    #[serde(rename = "shardCount")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard_count: Option<u32>,
    #[serde(rename = "shardFiles")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard_files: Option<Vec<PathBuf>>,
    #[serde(rename = "projectorPath")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projector_path: Option<PathBuf>,
    pub metadata: ModelMetadata,
    pub favourite: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(rename = "scannedAt")]
    pub scanned_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    /// How this model was discovered. Always `"local"` today; a carrier
    /// field for the search filter's `source type` dimension ahead of any
    /// non-filesystem source.
    #[serde(rename = "sourceType")]
    pub source_type: String,
}

/// The only model source this registry implements.
pub const LOCAL_SOURCE_TYPE: &str = "local";

// `ModelMetadata` has no `Serialize`/`Deserialize` impl (it lives in the
// metadata-parsing module, which has no wire concerns), derive it here via
// a thin mirror so `Model` itself can serialize.
impl Serialize for ModelMetadata {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("ModelMetadata", 5)?;
        s.serialize_field("architecture", &self.architecture)?;
        s.serialize_field("contextLength", &self.context_length)?;
        s.serialize_field("embeddingLength", &self.embedding_length)?;
        s.serialize_field("quantizationDescriptor", &self.quantization_descriptor)?;
        s.serialize_field("modelName", &self.model_name)?;
        s.end()
    }
}

impl<'de> Deserialize<'de> for ModelMetadata {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Shadow {
            architecture: Option<String>,
            #[serde(rename = "contextLength")]
            context_length: Option<u64>,
            #[serde(rename = "embeddingLength")]
            embedding_length: Option<u64>,
            #[serde(rename = "quantizationDescriptor")]
            quantization_descriptor: Option<String>,
            #[serde(rename = "modelName")]
            model_name: Option<String>,
        }
        let shadow = Shadow::deserialize(deserializer)?;
        Ok(ModelMetadata {
            architecture: shadow.architecture,
            context_length: shadow.context_length,
            embedding_length: shadow.embedding_length,
            quantization_descriptor: shadow.quantization_descriptor,
            model_name: shadow.model_name,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Name,
    Size,
    ScannedAt,
    LoadCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub tags: Vec<String>,
    pub architecture: Option<String>,
    pub min_context_length: Option<u64>,
    pub max_size: Option<u64>,
    pub loaded_only: bool,
    pub favourites_only: bool,
    pub query: Option<String>,
    pub source_type: Option<String>,
    pub license: Option<String>,
}

pub struct ScanSummary {
    pub model_count: usize,
    pub errors: Vec<(PathBuf, String)>,
}

/// The registry: in-memory catalog plus scan/query/status operations.
pub struct ModelRegistry {
    catalog: DashMap<String, Model>,
    statuses: DashMap<String, ModelStatus>,
    load_counts: DashMap<String, u32>,
    scanning: AtomicBool,
    scan_roots: Vec<PathBuf>,
    catalog_path: PathBuf,
    empty_wait: Duration,
    scan_seq: AtomicU32,
}

impl ModelRegistry {
    pub fn new(scan_roots: Vec<PathBuf>, catalog_path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            catalog: DashMap::new(),
            statuses: DashMap::new(),
            load_counts: DashMap::new(),
            scanning: AtomicBool::new(false),
            scan_roots,
            catalog_path,
            empty_wait: Duration::from_secs(10),
            scan_seq: AtomicU32::new(0),
        })
    }

    /// Load the persisted catalog, dropping entries whose file vanished and
    /// re-running shard-merging so that live IDs track the merge logic even
    /// if the persisted file predates it.
    pub async fn load_from_disk(&self) -> Result<(), ModelError> {
        let persisted = catalog::load(&self.catalog_path).await?;

        let mut candidates = Vec::new();
        let mut all_paths = Vec::new();
        for entry in persisted.entries {
            if !tokio::fs::try_exists(&entry.path).await.unwrap_or(false) {
                continue;
            }
            all_paths.push(entry.path.clone());
            if let Some(shards) = &entry.shard_files {
                all_paths.extend(shards.iter().cloned());
            }
            if let Some(projector) = &entry.projector {
                all_paths.push(projector.clone());
            }

            let metadata = entry
                .primary_model
                .map(|p| ModelMetadata {
                    architecture: p.architecture,
                    context_length: p.context_length,
                    embedding_length: p.embedding_length,
                    quantization_descriptor: None,
                    model_name: None,
                })
                .unwrap_or_default();

            candidates.push(scan::Candidate {
                path: entry.path,
                size: entry.size,
                metadata,
            });
        }

        let models = scan::merge_shards(candidates, &all_paths);
        self.catalog.clear();
        for model in models {
            self.catalog.insert(model.id.clone(), model);
        }
        Ok(())
    }

    /// Run a scan. Fails with `ScanInProgress` if one is already running.
    pub async fn scan(&self) -> Result<ScanSummary, ModelError> {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ModelError::ScanInProgress);
        }

        let result = self.run_scan().await;
        self.scanning.store(false, Ordering::SeqCst);
        result
    }

    async fn run_scan(&self) -> Result<ScanSummary, ModelError> {
        let result = scan::scan_roots(&self.scan_roots).await?;

        self.catalog.clear();
        for model in &result.models {
            self.catalog.insert(model.id.clone(), model.clone());
        }

        if let Err(e) = catalog::save(&self.catalog_path, &self.snapshot_map()).await {
            error!(error = %e, "failed to persist catalog after scan");
        }

        for (path, message) in &result.errors {
            warn!(path = %path.display(), error = %message, "scan error for file");
        }

        self.scan_seq.fetch_add(1, Ordering::SeqCst);
        info!(models = result.models.len(), errors = result.errors.len(), "scan complete");

        Ok(ScanSummary {
            model_count: result.models.len(),
            errors: result.errors,
        })
    }

    fn snapshot_map(&self) -> std::collections::HashMap<String, Model> {
        self.catalog
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn get_model(&self, id: &str) -> Option<Model> {
        self.catalog.get(id).map(|e| e.value().clone())
    }

    pub fn list_models(&self) -> Vec<Model> {
        self.catalog.iter().map(|e| e.value().clone()).collect()
    }

    pub fn get_status(&self, id: &str) -> ModelStatus {
        self.statuses.get(id).map(|e| e.value().clone()).unwrap_or_default()
    }

    pub fn set_status(&self, id: &str, status: ModelStatus) {
        self.statuses.insert(id.to_string(), status);
    }

    pub fn record_load(&self, id: &str) {
        *self.load_counts.entry(id.to_string()).or_insert(0) += 1;
    }

    fn load_count(&self, id: &str) -> u32 {
        self.load_counts.get(id).map(|c| *c).unwrap_or(0)
    }

    /// Query with filter/sort. If the catalog is empty, triggers a scan and
    /// waits up to 10 s for it to complete before answering.
    pub async fn search(
        &self,
        filter: &SearchFilter,
        sort: SortKey,
        direction: SortDirection,
    ) -> Vec<Model> {
        if self.catalog.is_empty() {
            let _ = timeout(self.empty_wait, self.scan()).await;
        }

        let mut models: Vec<Model> = self
            .catalog
            .iter()
            .map(|e| e.value().clone())
            .filter(|m| matches_filter(m, filter))
            .filter(|m| !filter.loaded_only || self.get_status(&m.id).state == ModelState::Loaded)
            .collect();

        sort_models(&mut models, sort, direction, |id| self.load_count(id));
        models
    }
}

/// Parameters for a load request beyond the model's own identity.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub context_size: u32,
    pub threads: u32,
    pub gpu_layers: u32,
    pub flash_attention: bool,
    pub no_mmap: bool,
    pub mlock: bool,
    pub executable_override: Option<PathBuf>,
    pub extra_args: Vec<String>,
    pub readiness_marker: Option<String>,
    pub binary_dir: PathBuf,
    pub inference_binary_name: String,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            context_size: 4096,
            threads: 4,
            gpu_layers: 0,
            flash_attention: false,
            no_mmap: false,
            mlock: false,
            executable_override: None,
            extra_args: Vec::new(),
            readiness_marker: None,
            binary_dir: PathBuf::new(),
            inference_binary_name: String::new(),
        }
    }
}

pub struct LoadOutcome {
    pub model_id: String,
    pub port: u16,
    pub duration_millis: u64,
}

pub struct AsyncLoadOutcome {
    pub already_loaded: bool,
    pub already_loading: bool,
}

impl ModelRegistry {
    fn begin_loading(&self, model_id: &str) -> Result<(), ModelError> {
        let mut status = self.statuses.entry(model_id.to_string()).or_default();
        if status.state == ModelState::Loading {
            return Err(ModelError::AlreadyLoading(model_id.to_string()));
        }
        status.state = ModelState::Loading;
        Ok(())
    }

    fn mark_error(&self, model_id: &str, message: String) {
        let mut status = self.statuses.entry(model_id.to_string()).or_default();
        status.state = ModelState::Error;
        status.last_error = Some(message);
    }

    fn build_argv(
        &self,
        model: &Model,
        port: u16,
        options: &LoadOptions,
    ) -> (PathBuf, Vec<String>) {
        let request = crate::supervisor::argv::LoadRequest {
            model_path: model.path.clone(),
            port,
            context_size: options.context_size,
            threads: options.threads,
            gpu_layers: options.gpu_layers,
            flash_attention: options.flash_attention,
            no_mmap: options.no_mmap,
            mlock: options.mlock,
            projector_path: model.projector_path.clone(),
            executable_override: options.executable_override.clone(),
            extra_args: options.extra_args.clone(),
        };
        let executable = crate::supervisor::argv::resolve_executable(
            &options.binary_dir,
            &options.inference_binary_name,
            &request,
        );
        (executable, crate::supervisor::argv::generate_args(&request))
    }

    /// Synchronous load: spawn and return once the process has started
    /// (not necessarily ready; callers that need readiness use
    /// `load_model_async` and wait on the returned receiver).
    pub async fn load_model(
        &self,
        model_id: &str,
        supervisor: &Arc<crate::supervisor::ProcessSupervisor>,
        ports: &crate::supervisor::port::PortAllocator,
        options: LoadOptions,
    ) -> Result<LoadOutcome, ModelError> {
        let start = std::time::Instant::now();
        let model = self
            .get_model(model_id)
            .ok_or_else(|| ModelError::NotFound(model_id.to_string()))?;

        self.begin_loading(model_id)?;

        let port = match ports.next_port() {
            Ok(p) => p,
            Err(e) => {
                self.mark_error(model_id, e.to_string());
                return Err(e.into());
            }
        };

        let (executable, args) = self.build_argv(&model, port, &options);
        let readiness = match &options.readiness_marker {
            Some(marker) => crate::supervisor::ReadinessCheck::Marker(marker.clone()),
            None => crate::supervisor::ReadinessCheck::HealthPoll,
        };

        let spawn_result = supervisor
            .start(model_id, &model.display_name, &executable, &args, port, readiness, None)
            .await;

        let (process, _ready_rx) = match spawn_result {
            Ok(v) => v,
            Err(e) => {
                ports.release(port);
                self.mark_error(model_id, e.to_string());
                return Err(e.into());
            }
        };

        self.record_load(model_id);
        let mut status = self.statuses.entry(model_id.to_string()).or_default();
        status.state = ModelState::Loaded;
        status.process_id = process.pid;
        status.port = Some(port);
        status.loaded_at = Some(Utc::now());
        status.last_error = None;

        Ok(LoadOutcome {
            model_id: model_id.to_string(),
            port,
            duration_millis: start.elapsed().as_millis() as u64,
        })
    }

    /// Asynchronous load: returns immediately; a background task waits on
    /// the readiness signal with the 10-minute deadline and updates status.
    /// Takes an owned `Arc<ModelRegistry>` (rather than `&self`) because the
    /// spawned background task must outlive this call.
    pub async fn load_model_async(
        registry: Arc<Self>,
        model_id: &str,
        supervisor: Arc<crate::supervisor::ProcessSupervisor>,
        ports: Arc<crate::supervisor::port::PortAllocator>,
        options: LoadOptions,
    ) -> Result<AsyncLoadOutcome, ModelError> {
        let this = &registry;
        if this.get_status(model_id).state == ModelState::Loaded {
            return Ok(AsyncLoadOutcome {
                already_loaded: true,
                already_loading: false,
            });
        }

        let model = this
            .get_model(model_id)
            .ok_or_else(|| ModelError::NotFound(model_id.to_string()))?;

        if let Err(ModelError::AlreadyLoading(_)) = this.begin_loading(model_id) {
            return Ok(AsyncLoadOutcome {
                already_loaded: false,
                already_loading: true,
            });
        }

        let port = match ports.next_port() {
            Ok(p) => p,
            Err(e) => {
                this.mark_error(model_id, e.to_string());
                return Err(e.into());
            }
        };

        let (executable, args) = this.build_argv(&model, port, &options);
        let readiness = match &options.readiness_marker {
            Some(marker) => crate::supervisor::ReadinessCheck::Marker(marker.clone()),
            None => crate::supervisor::ReadinessCheck::HealthPoll,
        };

        let registry = Arc::clone(&registry);
        let model_id = model_id.to_string();
        let display_name = model.display_name.clone();

        tokio::spawn(async move {
            let spawn_result = supervisor
                .start(&model_id, &display_name, &executable, &args, port, readiness, None)
                .await;

            let (process, ready_rx) = match spawn_result {
                Ok(v) => v,
                Err(e) => {
                    ports.release(port);
                    registry.mark_error(&model_id, e.to_string());
                    return;
                }
            };

            let became_ready = tokio::time::timeout(Duration::from_secs(600), ready_rx).await;
            match became_ready {
                Ok(Ok(true)) => {
                    registry.record_load(&model_id);
                    let mut status = registry.statuses.entry(model_id.clone()).or_default();
                    status.state = ModelState::Loaded;
                    status.process_id = process.pid;
                    status.port = Some(port);
                    status.loaded_at = Some(Utc::now());
                    status.last_error = None;
                }
                _ => {
                    let _ = supervisor.stop(&model_id).await;
                    ports.release(port);
                    registry.mark_error(&model_id, "worker did not become ready in time".to_string());
                }
            }
        });

        Ok(AsyncLoadOutcome {
            already_loaded: false,
            already_loading: false,
        })
    }

    /// Requires current state LOADED. Stops the worker, releases its port.
    pub async fn unload_model(
        &self,
        model_id: &str,
        supervisor: &crate::supervisor::ProcessSupervisor,
        ports: &crate::supervisor::port::PortAllocator,
    ) -> Result<(), ModelError> {
        let current_state = self.get_status(model_id).state;
        if current_state != ModelState::Loaded {
            return Err(ModelError::InvalidState(
                model_id.to_string(),
                format!("cannot unload from state {current_state:?}"),
            ));
        }

        {
            let mut status = self.statuses.entry(model_id.to_string()).or_default();
            status.state = ModelState::Unloading;
        }

        let port = self.get_status(model_id).port;
        supervisor.stop(model_id).await?;
        if let Some(port) = port {
            ports.release(port);
        }

        let mut status = self.statuses.entry(model_id.to_string()).or_default();
        status.state = ModelState::Unloaded;
        status.process_id = None;
        status.port = None;
        Ok(())
    }
}

fn matches_filter(model: &Model, filter: &SearchFilter) -> bool {
    if !filter.tags.is_empty() && !filter.tags.iter().any(|t| model.tags.contains(t)) {
        return false;
    }
    if let Some(arch) = &filter.architecture {
        let matches = model
            .metadata
            .architecture
            .as_ref()
            .is_some_and(|a| a.eq_ignore_ascii_case(arch));
        if !matches {
            return false;
        }
    }
    if let Some(min_ctx) = filter.min_context_length {
        if model.metadata.context_length.unwrap_or(0) < min_ctx {
            return false;
        }
    }
    if let Some(max_size) = filter.max_size {
        if model.size > max_size {
            return false;
        }
    }
    if filter.favourites_only && !model.favourite {
        return false;
    }
    if let Some(source_type) = &filter.source_type {
        if !model.source_type.eq_ignore_ascii_case(source_type) {
            return false;
        }
    }
    if let Some(license) = &filter.license {
        let matches = model.license.as_ref().is_some_and(|l| l.eq_ignore_ascii_case(license));
        if !matches {
            return false;
        }
    }
    if let Some(query) = &filter.query {
        let q = query.to_lowercase();
        let haystack = [
            Some(model.name.clone()),
            model.alias.clone(),
            model.description.clone(),
            model.metadata.architecture.clone(),
        ];
        let found = haystack
            .iter()
            .flatten()
            .any(|field| field.to_lowercase().contains(&q));
        if !found {
            return false;
        }
    }
    true
}

fn sort_models(
    models: &mut [Model],
    key: SortKey,
    direction: SortDirection,
    load_count: impl Fn(&str) -> u32,
) {
    models.sort_by(|a, b| {
        let ordering = match key {
            SortKey::Name => a.name.cmp(&b.name),
            SortKey::Size => a.size.cmp(&b.size),
            SortKey::ScannedAt => a.scanned_at.cmp(&b.scanned_at),
            SortKey::LoadCount => load_count(&a.id).cmp(&load_count(&b.id)),
        };
        match direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_model(name: &str, size: u64) -> Model {
        Model {
            id: name.to_string(),
            name: name.to_string(),
            display_name: name.to_string(),
            alias: None,
            path: PathBuf::from(format!("/models/{name}.gguf")),
            path_prefix: "/models".to_string(),
            size,
            total_size: Some(size),
            shard_count: None,
            shard_files: None,
            projector_path: None,
            metadata: ModelMetadata::default(),
            favourite: false,
            tags: vec![],
            scanned_at: Utc::now(),
            description: None,
            license: None,
            source_type: LOCAL_SOURCE_TYPE.to_string(),
        }
    }

    #[test]
    fn sort_by_size_descending() {
        let mut models = vec![sample_model("a", 10), sample_model("b", 100), sample_model("c", 1)];
        sort_models(&mut models, SortKey::Size, SortDirection::Desc, |_| 0);
        assert_eq!(models.iter().map(|m| m.name.clone()).collect::<Vec<_>>(), vec!["b", "a", "c"]);
    }

    #[test]
    fn filter_by_max_size_excludes_larger() {
        let models = vec![sample_model("a", 10), sample_model("b", 1000)];
        let filter = SearchFilter {
            max_size: Some(100),
            ..Default::default()
        };
        let kept: Vec<_> = models.into_iter().filter(|m| matches_filter(m, &filter)).collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "a");
    }

    #[test]
    fn filter_by_license_is_case_insensitive() {
        let mut licensed = sample_model("a", 10);
        licensed.license = Some("Apache-2.0".to_string());
        let models = vec![licensed, sample_model("b", 10)];

        let filter = SearchFilter {
            license: Some("apache-2.0".to_string()),
            ..Default::default()
        };
        let kept: Vec<_> = models.into_iter().filter(|m| matches_filter(m, &filter)).collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "a");
    }

    #[test]
    fn filter_by_source_type_excludes_others() {
        let models = vec![sample_model("a", 10)];
        let filter = SearchFilter {
            source_type: Some("remote".to_string()),
            ..Default::default()
        };
        let kept: Vec<_> = models.into_iter().filter(|m| matches_filter(m, &filter)).collect();
        assert!(kept.is_empty());
    }

    #[tokio::test]
    async fn scan_in_progress_rejects_concurrent_scan() {
        let registry = ModelRegistry::new(vec![], PathBuf::from("/tmp/does-not-matter.json"));
        registry.scanning.store(true, Ordering::SeqCst);
        let result = registry.scan().await;
        assert!(matches!(result, Err(ModelError::ScanInProgress)));
    }
}
