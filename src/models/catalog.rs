//! Catalog persistence: the registry's on-disk view of scanned models.
//!
//! Grounded on `config/mod.rs::load_composition_file`'s "read the whole
//! file, deserialize, map I/O errors to a typed error" shape.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{Model, ModelError};

/// One model's persisted record, a compact projection of `Model`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub path: PathBuf,
    pub size: u64,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub favourite: bool,
    #[serde(default)]
    pub shard_count: Option<u32>,
    #[serde(default)]
    pub shard_files: Option<Vec<PathBuf>>,
    #[serde(default)]
    pub projector: Option<PathBuf>,
    #[serde(default)]
    pub primary_model: Option<PrimaryMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryMetadata {
    pub architecture: Option<String>,
    pub context_length: Option<u64>,
    pub embedding_length: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Catalog {
    pub entries: Vec<CatalogEntry>,
}

impl From<&Model> for CatalogEntry {
    fn from(model: &Model) -> Self {
        CatalogEntry {
            id: model.id.clone(),
            path: model.path.clone(),
            size: model.size,
            alias: model.alias.clone(),
            favourite: model.favourite,
            shard_count: model.shard_count,
            shard_files: model.shard_files.clone(),
            projector: model.projector_path.clone(),
            primary_model: Some(PrimaryMetadata {
                architecture: model.metadata.architecture.clone(),
                context_length: model.metadata.context_length,
                embedding_length: model.metadata.embedding_length,
            }),
        }
    }
}

/// Write the catalog to `path` as pretty JSON, overwriting any prior file.
pub async fn save(path: &Path, models: &HashMap<String, Model>) -> Result<(), ModelError> {
    let catalog = Catalog {
        entries: models.values().map(CatalogEntry::from).collect(),
    };
    let body = serde_json::to_string_pretty(&catalog)
        .map_err(|e| ModelError::Catalog(format!("serialize catalog: {e}")))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ModelError::Catalog(format!("create catalog dir: {e}")))?;
    }
    tokio::fs::write(path, body)
        .await
        .map_err(|e| ModelError::Catalog(format!("write catalog: {e}")))
}

/// Load the catalog from `path`. A missing file is treated as an empty
/// catalog rather than an error (first run).
pub async fn load(path: &Path) -> Result<Catalog, ModelError> {
    match tokio::fs::read_to_string(path).await {
        Ok(body) => serde_json::from_str(&body)
            .map_err(|e| ModelError::Catalog(format!("parse catalog: {e}"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Catalog::default()),
        Err(e) => Err(ModelError::Catalog(format!("read catalog: {e}"))),
    }
}
