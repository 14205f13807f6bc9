use anyhow::{anyhow, Context, Result};
use candle::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const SINGLE_WEIGHTS: &str = "model.safetensors";
const SHARD_INDEX: &str = "model.safetensors.index.json";
const PTH_WEIGHTS: &str = "pytorch_model.bin";

/// Where a model's files come from: a directory on disk, or a hub repo id
/// fetched into the local hf-hub cache.
#[derive(Clone, Debug)]
pub enum ModelSource {
    Local(PathBuf),
    Hub { repo_id: String, revision: String },
}

impl ModelSource {
    pub fn from_parts(dir: Option<PathBuf>, repo_id: &str) -> Self {
        match dir {
            Some(dir) => ModelSource::Local(dir),
            None => ModelSource::Hub {
                repo_id: repo_id.to_string(),
                revision: "main".into(),
            },
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ModelSource::Local(dir) => dir.display().to_string(),
            ModelSource::Hub { repo_id, revision } => format!("{repo_id}@{revision}"),
        }
    }
}

/// Resolved snapshot: the directory plus the weight files inside it.
#[derive(Debug)]
pub struct Snapshot {
    pub dir: PathBuf,
    pub weights: Vec<PathBuf>,
}

impl Snapshot {
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.file(name).exists()
    }

    pub fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        read_json(&self.file(name))
    }

    pub fn var_builder(&self, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
        build_var_builder(&self.weights, dtype, device)
    }
}

/// Resolve `source` into a snapshot holding `config.json`, `tokenizer.json`,
/// the weights, and whichever `optional` files exist.
pub fn resolve(source: &ModelSource, optional: &[&str]) -> Result<Snapshot> {
    match source {
        ModelSource::Local(dir) => resolve_local(dir),
        ModelSource::Hub { repo_id, revision } => resolve_hub(repo_id, revision, optional),
    }
}

fn resolve_local(dir: &Path) -> Result<Snapshot> {
    for required in ["config.json", "tokenizer.json"] {
        if !dir.join(required).exists() {
            return Err(anyhow!("{required} not found under {}", dir.display()));
        }
    }
    let weights = find_model_weights(dir)?
        .ok_or_else(|| anyhow!("no model weights found under {}", dir.display()))?;
    Ok(Snapshot {
        dir: dir.to_path_buf(),
        weights,
    })
}

fn resolve_hub(repo_id: &str, revision: &str, optional: &[&str]) -> Result<Snapshot> {
    info!(repo = repo_id, revision, "fetching model snapshot from hub");
    let api = ApiBuilder::new()
        .with_progress(false)
        .build()
        .context("failed to initialise hf-hub client")?;
    let repo = api.repo(Repo::with_revision(
        repo_id.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));

    let config = repo
        .get("config.json")
        .with_context(|| format!("{repo_id}: config.json"))?;
    repo.get("tokenizer.json")
        .with_context(|| format!("{repo_id}: tokenizer.json"))?;

    for name in optional {
        if let Err(err) = repo.get(name) {
            warn!(repo = repo_id, file = *name, "optional file unavailable: {err}");
        }
    }

    let weights = fetch_weights(&repo, repo_id)?;
    let dir = config
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("hf-hub returned a path without parent: {}", config.display()))?;

    Ok(Snapshot { dir, weights })
}

fn fetch_weights(repo: &ApiRepo, repo_id: &str) -> Result<Vec<PathBuf>> {
    if let Ok(single) = repo.get(SINGLE_WEIGHTS) {
        return Ok(vec![single]);
    }

    if let Ok(index) = repo.get(SHARD_INDEX) {
        let names = shard_names(&index)?;
        return names
            .iter()
            .map(|name| {
                repo.get(name)
                    .with_context(|| format!("{repo_id}: shard {name}"))
            })
            .collect();
    }

    let pth = repo
        .get(PTH_WEIGHTS)
        .with_context(|| format!("{repo_id}: no safetensors or {PTH_WEIGHTS} weights"))?;
    Ok(vec![pth])
}

fn find_model_weights(dir: &Path) -> Result<Option<Vec<PathBuf>>> {
    let single = dir.join(SINGLE_WEIGHTS);
    if single.exists() {
        return Ok(Some(vec![single]));
    }

    let index = dir.join(SHARD_INDEX);
    if index.exists() {
        let shards = shard_names(&index)?
            .into_iter()
            .map(|name| dir.join(name))
            .collect();
        return Ok(Some(shards));
    }

    let pth = dir.join(PTH_WEIGHTS);
    if pth.exists() {
        return Ok(Some(vec![pth]));
    }

    Ok(None)
}

/// Unique shard file names from a safetensors index, in first-seen order.
fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let index: serde_json::Value = read_json(index_path)?;
    let map = index["weight_map"]
        .as_object()
        .ok_or_else(|| anyhow!("{}: weight_map is not an object", index_path.display()))?;

    let mut names: Vec<String> = Vec::new();
    for value in map.values() {
        let file = value
            .as_str()
            .ok_or_else(|| anyhow!("invalid shard entry in {}", index_path.display()))?;
        if !names.iter().any(|n| n == file) {
            names.push(file.to_string());
        }
    }
    Ok(names)
}

fn build_var_builder(
    weights: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let is_pth = weights.len() == 1
        && weights[0]
            .extension()
            .and_then(|s| s.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("bin"))
            .unwrap_or(false);

    if is_pth {
        return VarBuilder::from_pth(&weights[0], dtype, device)
            .map_err(|e| anyhow!("failed to load {}: {e}", weights[0].display()));
    }

    // mmap is sound as long as the snapshot files are not modified while loaded.
    unsafe {
        VarBuilder::from_mmaped_safetensors(weights, dtype, device)
            .map_err(|e| anyhow!("failed to mmap safetensors: {e}"))
    }
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

/// `cpu`, `cuda`, `cuda:N` or `gpu:N`. Anything else falls back to CPU.
pub fn parse_device(value: &str) -> Result<Device> {
    let trimmed = value.trim();
    let lower = trimmed.to_ascii_lowercase();
    if lower.is_empty() || lower == "cpu" {
        Ok(Device::Cpu)
    } else if lower.starts_with("cuda") || lower.starts_with("gpu") {
        let ordinal = trimmed
            .split(':')
            .nth(1)
            .and_then(|part| part.parse::<usize>().ok())
            .unwrap_or(0);
        Device::new_cuda(ordinal).map_err(|err| {
            anyhow!(
                "requested CUDA device {ordinal} but initialization failed ({err}). Build with \
                 the `cuda` feature and ensure CUDA libraries are available."
            )
        })
    } else {
        warn!("unrecognized SIDECAR_DEVICE value '{}', using cpu", trimmed);
        Ok(Device::Cpu)
    }
}
