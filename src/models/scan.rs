//! Scan algorithm: walk configured roots, classify candidate files, read
//! their metadata with bounded concurrency, and merge shard groups.
//!
//! Split the way the teacher splits composition parsing: pure
//! classification/grouping functions below, a single I/O-boundary function
//! (`scan_roots`) that walks the filesystem and owns the concurrency limit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::warn;

use super::metadata::{self, ModelMetadata};
use super::{Model, ModelError, LOCAL_SOURCE_TYPE};

const MAX_CONCURRENT_READS: usize = 10;
const MIN_MODEL_SIZE: u64 = 1024;

static SHARD_PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();

fn shard_pattern() -> &'static Regex {
    SHARD_PATTERN.get_or_init(|| Regex::new(r"^(.*)-(\d{5})-of-(\d{5})\.gguf$").unwrap())
}

/// `true` if `path`'s basename identifies it as a standalone model file
/// rather than an accessory (a projector) or unrelated file.
pub fn is_model_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let lower = name.to_lowercase();

    if lower.contains("mmproj") {
        return false;
    }

    if lower.contains(".gguf") || lower.starts_with("gguf-") {
        return true;
    }

    if is_huggingface_cache_gguf(path) {
        return true;
    }

    if is_snapshot_weights(path, &lower) {
        return true;
    }

    false
}

fn is_huggingface_cache_gguf(path: &Path) -> bool {
    if !path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("gguf"))
    {
        return false;
    }
    path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .is_some_and(|s| s.starts_with("models--"))
    })
}

fn is_snapshot_weights(path: &Path, lower_name: &str) -> bool {
    let under_snapshots = path
        .components()
        .any(|c| c.as_os_str() == "snapshots");
    under_snapshots && (lower_name.ends_with(".safetensors") || lower_name.ends_with(".bin"))
}

/// Shard identity parsed from a filename matching the shard pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ShardKey {
    dir: PathBuf,
    base: String,
    total: u32,
}

struct ShardMatch {
    key: ShardKey,
    part: u32,
    path: PathBuf,
}

fn match_shard(path: &Path) -> Option<ShardMatch> {
    let name = path.file_name()?.to_str()?;
    let caps = shard_pattern().captures(name)?;
    let base = caps.get(1)?.as_str().to_string();
    let part: u32 = caps.get(2)?.as_str().parse().ok()?;
    let total: u32 = caps.get(3)?.as_str().parse().ok()?;
    let dir = path.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
    Some(ShardMatch {
        key: ShardKey { dir, base, total },
        part,
        path: path.to_path_buf(),
    })
}

/// A loaded candidate before shard-merging: one file, its size, and metadata.
pub struct Candidate {
    pub path: PathBuf,
    pub size: u64,
    pub metadata: ModelMetadata,
}

/// Result of one full scan: the merged catalog plus any per-file errors.
pub struct ScanResult {
    pub models: Vec<Model>,
    pub errors: Vec<(PathBuf, String)>,
}

/// Projector filename candidates to try, in order, for shard base `base`.
fn projector_candidates(base: &str) -> Vec<String> {
    vec![
        format!("mmproj-{base}.gguf"),
        format!("{base}-mmproj.gguf"),
        format!("{base}-mmproj-F32.gguf"),
        format!("{base}-mmproj-f32.gguf"),
        format!("{base}-mmproj-F16.gguf"),
        format!("{base}-mmproj-f16.gguf"),
    ]
}

fn find_projector(dir: &Path, base: &str, dir_listing: &[PathBuf]) -> Option<PathBuf> {
    for candidate in projector_candidates(base) {
        let full = dir.join(&candidate);
        if dir_listing.contains(&full) {
            return Some(full);
        }
    }
    dir_listing
        .iter()
        .find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.to_lowercase().contains("mmproj"))
        })
        .cloned()
}

/// `id = <basename-without-extension>-<hex(sha256(path)[:8])>`.
pub fn generate_single_id(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("model");
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    format!("{stem}-{}", hex8(&digest))
}

/// `id = <base>-<shardCount>parts-<hex(sha256(base)[:8])>`.
pub fn generate_unified_id(base: &str, shard_count: usize) -> String {
    let digest = Sha256::digest(base.as_bytes());
    format!("{base}-{shard_count}parts-{}", hex8(&digest))
}

fn hex8(digest: &[u8]) -> String {
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Group raw candidates into final `Model` records: singles pass through
/// (with a path-hash id), shard groups of size ≥ 2 merge into one model.
pub fn merge_shards(candidates: Vec<Candidate>, all_paths: &[PathBuf]) -> Vec<Model> {
    let mut grouped: HashMap<ShardKey, Vec<(u32, Candidate)>> = HashMap::new();
    let mut singles = Vec::new();

    for candidate in candidates {
        match match_shard(&candidate.path) {
            Some(shard) => grouped.entry(shard.key).or_default().push((shard.part, candidate)),
            None => singles.push(candidate),
        }
    }

    let mut models = Vec::new();

    for (key, mut parts) in grouped {
        if parts.len() < 2 {
            // A lone file that happens to match the shard pattern but has no
            // siblings is just a single model under that name.
            let (_, candidate) = parts.pop().unwrap();
            models.push(single_model(candidate));
            continue;
        }

        parts.sort_by_key(|(part, _)| *part);
        let expected: Vec<u32> = (1..=key.total).collect();
        let actual: Vec<u32> = parts.iter().map(|(p, _)| *p).collect();
        if actual != expected {
            warn!(base = %key.base, ?actual, ?expected, "shard sequence has gaps");
        }

        let shard_files: Vec<PathBuf> = parts.iter().map(|(_, c)| c.path.clone()).collect();
        let shard_size_sum: u64 = parts.iter().map(|(_, c)| c.size).sum();
        let primary = parts.first().unwrap().1.path.clone();
        let primary_metadata = parts.first().unwrap().1.metadata.clone();

        let projector = find_projector(&key.dir, &key.base, all_paths);
        let projector_size = projector
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0);

        let id = generate_unified_id(&key.base, parts.len());

        models.push(Model {
            id,
            name: key.base.clone(),
            display_name: key.base.clone(),
            alias: None,
            path: primary,
            path_prefix: key.dir.to_string_lossy().into_owned(),
            size: shard_size_sum,
            total_size: Some(shard_size_sum + projector_size),
            shard_count: Some(parts.len() as u32),
            shard_files: Some(shard_files),
            projector_path: projector,
            metadata: primary_metadata,
            favourite: false,
            tags: Vec::new(),
            scanned_at: Utc::now(),
            description: None,
            license: None,
            source_type: LOCAL_SOURCE_TYPE.to_string(),
        });
    }

    models.extend(singles.into_iter().map(single_model));
    models
}

fn single_model(candidate: Candidate) -> Model {
    let id = generate_single_id(&candidate.path);
    let name = candidate
        .path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("model")
        .to_string();
    let path_prefix = candidate
        .path
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();

    Model {
        id,
        display_name: name.clone(),
        name,
        alias: None,
        path: candidate.path,
        path_prefix,
        size: candidate.size,
        total_size: Some(candidate.size),
        shard_count: None,
        shard_files: None,
        projector_path: None,
        metadata: candidate.metadata,
        favourite: false,
        tags: Vec::new(),
        scanned_at: Utc::now(),
        description: None,
        license: None,
        source_type: LOCAL_SOURCE_TYPE.to_string(),
    }
}

/// Walk `roots`, classify candidates, read metadata with bounded
/// concurrency, and merge shards. Per-file failures are collected rather
/// than aborting the scan.
pub async fn scan_roots(roots: &[PathBuf]) -> Result<ScanResult, ModelError> {
    let mut all_files = Vec::new();
    for root in roots {
        collect_files(root, &mut all_files)?;
    }

    let mut file_candidates: Vec<PathBuf> = Vec::new();
    for path in &all_files {
        if is_model_file(path) {
            file_candidates.push(path.clone());
        }
    }

    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_READS));
    let mut join_set = tokio::task::JoinSet::new();

    for path in file_candidates {
        let semaphore = semaphore.clone();
        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let size = tokio::fs::metadata(&path)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            if size < MIN_MODEL_SIZE {
                return (path, Err("file too small to be a model".to_string()));
            }
            let read_path = path.clone();
            let result = tokio::task::spawn_blocking(move || metadata::read_metadata(&read_path))
                .await
                .unwrap_or_else(|e| Err(metadata_join_error(e)));
            match result {
                Ok(metadata) => (path, Ok((size, metadata))),
                Err(e) => (path, Err(e.to_string())),
            }
        });
    }

    let mut candidates = Vec::new();
    let mut errors = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        let (path, outcome) = joined.map_err(|e| ModelError::Scan(e.to_string()))?;
        match outcome {
            Ok((size, metadata)) => candidates.push(Candidate { path, size, metadata }),
            Err(message) => errors.push((path, message)),
        }
    }

    let models = merge_shards(candidates, &all_files);
    Ok(ScanResult { models, errors })
}

fn metadata_join_error(_e: tokio::task::JoinError) -> metadata::MetadataError {
    metadata::MetadataError::Truncated
}

fn collect_files(root: &Path, out: &mut Vec<PathBuf>) -> Result<(), ModelError> {
    if root.is_file() {
        out.push(root.to_path_buf());
        return Ok(());
    }

    let entries = std::fs::read_dir(root)
        .map_err(|e| ModelError::Scan(format!("cannot read {}: {e}", root.display())))?;

    for entry in entries {
        let entry = entry.map_err(|e| ModelError::Scan(e.to_string()))?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}
