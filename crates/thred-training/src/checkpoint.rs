//! Checkpoint bookkeeping.
//!
//! Execution contexts write the weight files themselves; this module records
//! them in a per-directory `checkpoint.json` manifest keyed by global step,
//! hashes them, prunes old ones and copies the best one aside.

use crate::error::{TrainingError, TrainingResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointFile {
    /// File name relative to the checkpoint directory.
    pub name: String,
    pub sha256: String,
}

/// A durable snapshot of trainable weights tagged by global step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub global_step: u64,
    pub created_at: DateTime<Utc>,
    pub files: Vec<CheckpointFile>,
    #[serde(skip)]
    dir: PathBuf,
}

impl Checkpoint {
    #[must_use]
    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| self.dir.join(&f.name)).collect()
    }

    /// Re-hashes every file and fails on the first mismatch.
    pub fn verify(&self) -> TrainingResult<()> {
        for file in &self.files {
            let path = self.dir.join(&file.name);
            if !path.exists() {
                return Err(TrainingError::Checkpoint(format!(
                    "checkpoint file missing: {}",
                    path.display()
                )));
            }
            let actual = sha256_file(&path)?;
            if actual != file.sha256 {
                return Err(TrainingError::Checkpoint(format!(
                    "checksum mismatch for {} (step {})",
                    path.display(),
                    self.global_step
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CheckpointManifest {
    latest: Option<u64>,
    checkpoints: Vec<Checkpoint>,
}

pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Checkpoints living in one directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    max_to_keep: usize,
}

impl CheckpointStore {
    pub const MANIFEST: &'static str = "checkpoint.json";

    /// `max_to_keep == 0` keeps everything.
    #[must_use]
    pub fn new(dir: PathBuf, max_to_keep: usize) -> Self {
        Self { dir, max_to_keep }
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join(Self::MANIFEST)
    }

    fn read_manifest(&self) -> TrainingResult<CheckpointManifest> {
        let path = self.manifest_path();
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CheckpointManifest::default());
            }
            Err(e) => return Err(e.into()),
        };
        let mut manifest: CheckpointManifest = serde_json::from_slice(&bytes)?;
        for ckpt in &mut manifest.checkpoints {
            ckpt.dir.clone_from(&self.dir);
        }
        Ok(manifest)
    }

    fn write_manifest(&self, manifest: &CheckpointManifest) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.manifest_path(), serde_json::to_string_pretty(manifest)?)?;
        Ok(())
    }

    /// All recorded checkpoints, oldest first.
    pub fn list(&self) -> TrainingResult<Vec<Checkpoint>> {
        Ok(self.read_manifest()?.checkpoints)
    }

    pub fn latest(&self) -> TrainingResult<Option<Checkpoint>> {
        let manifest = self.read_manifest()?;
        let Some(step) = manifest.latest else {
            return Ok(None);
        };
        Ok(manifest.checkpoints.into_iter().find(|c| c.global_step == step))
    }

    /// Records files just written by a train context as the checkpoint for
    /// `global_step`. Files must live directly in this store's directory.
    pub fn record(&self, global_step: u64, paths: &[PathBuf]) -> TrainingResult<Checkpoint> {
        if paths.is_empty() {
            return Err(TrainingError::Checkpoint(format!(
                "no files written for checkpoint at step {global_step}"
            )));
        }

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            if path.parent() != Some(self.dir.as_path()) {
                return Err(TrainingError::Checkpoint(format!(
                    "checkpoint file {} is outside {}",
                    path.display(),
                    self.dir.display()
                )));
            }
            if !path.exists() {
                return Err(TrainingError::Checkpoint(format!(
                    "checkpoint file does not exist: {}",
                    path.display()
                )));
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| TrainingError::Checkpoint(format!("bad path: {}", path.display())))?;
            files.push(CheckpointFile { name, sha256: sha256_file(path)? });
        }

        let checkpoint =
            Checkpoint { global_step, created_at: Utc::now(), files, dir: self.dir.clone() };

        let mut manifest = self.read_manifest()?;
        manifest.checkpoints.retain(|c| c.global_step != global_step);
        manifest.checkpoints.push(checkpoint.clone());
        manifest.checkpoints.sort_by_key(|c| c.global_step);
        manifest.latest = Some(global_step);
        self.prune(&mut manifest, global_step)?;
        self.write_manifest(&manifest)?;

        debug!(global_step, dir = %self.dir.display(), "Recorded checkpoint");
        Ok(checkpoint)
    }

    fn prune(&self, manifest: &mut CheckpointManifest, keep_step: u64) -> TrainingResult<()> {
        if self.max_to_keep == 0 {
            return Ok(());
        }
        while manifest.checkpoints.len() > self.max_to_keep {
            let Some(pos) = manifest.checkpoints.iter().position(|c| c.global_step != keep_step)
            else {
                break;
            };
            let old = manifest.checkpoints.remove(pos);
            let kept: Vec<&str> = manifest
                .checkpoints
                .iter()
                .flat_map(|c| c.files.iter().map(|f| f.name.as_str()))
                .collect();
            for file in &old.files {
                if kept.contains(&file.name.as_str()) {
                    continue;
                }
                match std::fs::remove_file(self.dir.join(&file.name)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            debug!(global_step = old.global_step, "Pruned checkpoint");
        }
        Ok(())
    }

    /// Copies a checkpoint from another directory into this one and records it.
    pub fn import(&self, checkpoint: &Checkpoint) -> TrainingResult<Checkpoint> {
        std::fs::create_dir_all(&self.dir)?;
        let mut copied = Vec::with_capacity(checkpoint.files.len());
        for file in &checkpoint.files {
            let dst = self.dir.join(&file.name);
            std::fs::copy(checkpoint.dir.join(&file.name), &dst)?;
            copied.push(dst);
        }
        self.record(checkpoint.global_step, &copied)
    }
}
