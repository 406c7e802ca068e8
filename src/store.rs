//! Persistence of the files that belong to a single run: the mask map and the masked and
//! transformed checkpoints.
//!
//! A mask map is created with create-new semantics so that only one run can own a given run id.
//! It stays on disk until unmasking succeeds, then it is moved to the archive, where only the
//! newest `archive_copies` maps are kept.

use crate::error::{Error, ErrorType, IntoResult, Res};
use crate::mask::MaskMap;
use crate::{utils, Config, Result};
use anyhow::Context;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::debug;

/// Prefix for archived mask map files.
pub const MASK_MAP: &str = "mask-map";

/// The documents saved while a run is in progress.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    /// The document as it was handed to the transform.
    Masked,
    /// The document as it came back from the transform.
    Transformed,
}

serde_plain::derive_display_from_serialize!(Checkpoint);

/// Reads and writes run files.
///
/// The `RunStore` struct is immutable and owns copies of the paths and settings it needs.
/// Create a new instance via `Config::store()` or `RunStore::new()`.
#[derive(Debug, Clone)]
pub struct RunStore {
    masks_dir: PathBuf,
    runs_dir: PathBuf,
    archive_dir: PathBuf,
    archive_copies: u32,
}

impl RunStore {
    pub fn new(config: &Config) -> Self {
        Self {
            masks_dir: config.masks().to_path_buf(),
            runs_dir: config.runs().to_path_buf(),
            archive_dir: config.archive().to_path_buf(),
            archive_copies: config.archive_copies(),
        }
    }

    pub fn map_path(&self, run_id: &str) -> PathBuf {
        self.masks_dir.join(format!("{run_id}.json"))
    }

    pub fn checkpoint_path(&self, run_id: &str, checkpoint: Checkpoint) -> PathBuf {
        self.runs_dir.join(format!("{run_id}.{checkpoint}.beancount"))
    }

    /// Persists a new map. The run id must not have been used by an unfinished run.
    ///
    /// # Errors
    /// Returns a `MaskingConflict` if a map for the same run id already exists.
    pub async fn create_map(&self, map: &MaskMap) -> Result<PathBuf> {
        let path = self.map_path(map.run_id());
        let json = serde_json::to_string_pretty(map)
            .context("Failed to serialize mask map")
            .pub_result(ErrorType::Storage)?;
        match tokio::fs::metadata(&path).await {
            Ok(_) => {
                return Err(Error::msg(
                    ErrorType::MaskingConflict,
                    format!(
                        "A mask map for run {} already exists at {}",
                        map.run_id(),
                        path.display()
                    ),
                ))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::new(
                    ErrorType::Storage,
                    anyhow::Error::new(e).context(format!("Unable to inspect {}", path.display())),
                ))
            }
        }
        // Another process may still win the race between the check above and this call.
        utils::write_new(&path, json)
            .await
            .pub_result(ErrorType::MaskingConflict)?;
        debug!("Saved mask map for run {} to {}", map.run_id(), path.display());
        Ok(path)
    }

    /// Loads the map of an unfinished run.
    pub async fn load_map(&self, run_id: &str) -> Result<MaskMap> {
        let path = self.map_path(run_id);
        let map: MaskMap = utils::deserialize(&path)
            .await
            .with_context(|| format!("Unable to load the mask map for run {run_id}"))
            .pub_result(ErrorType::Storage)?;
        if map.run_id() != run_id {
            return Err(Error::msg(
                ErrorType::Storage,
                format!(
                    "The mask map at {} belongs to run {}, not {run_id}",
                    path.display(),
                    map.run_id()
                ),
            ));
        }
        Ok(map)
    }

    pub async fn save_checkpoint(
        &self,
        run_id: &str,
        checkpoint: Checkpoint,
        document: &str,
    ) -> Result<PathBuf> {
        let path = self.checkpoint_path(run_id, checkpoint);
        utils::write_replace(&path, document)
            .await
            .pub_result(ErrorType::Storage)?;
        debug!("Saved {checkpoint} checkpoint to {}", path.display());
        Ok(path)
    }

    pub async fn load_checkpoint(&self, run_id: &str, checkpoint: Checkpoint) -> Result<String> {
        let path = self.checkpoint_path(run_id, checkpoint);
        utils::read(&path)
            .await
            .with_context(|| format!("No {checkpoint} checkpoint for run {run_id}"))
            .pub_result(ErrorType::Storage)
    }

    /// Moves the map of a finished run into the archive and removes its checkpoints.
    ///
    /// The archive filename format is `mask-map.YYYY-MM-DD-NNN.json` where NNN is a sequence
    /// number. Old archives are rotated, keeping only `archive_copies` files.
    ///
    /// Returns the path to the archived map.
    pub async fn archive(&self, run_id: &str) -> Result<PathBuf> {
        self.archive_inner(run_id)
            .await
            .pub_result(ErrorType::Storage)
    }

    async fn archive_inner(&self, run_id: &str) -> Res<PathBuf> {
        let date = today();
        let seq = self.next_sequence_number(MASK_MAP, &date).await?;
        let path = self
            .archive_dir
            .join(format!("{MASK_MAP}.{date}-{seq:03}.json"));
        utils::rename(self.map_path(run_id), &path).await?;

        for checkpoint in [Checkpoint::Masked, Checkpoint::Transformed] {
            let p = self.checkpoint_path(run_id, checkpoint);
            if p.is_file() {
                utils::remove(&p).await?;
            }
        }

        self.rotate(MASK_MAP).await?;
        debug!("Archived mask map for run {run_id} to {}", path.display());
        Ok(path)
    }

    /// Scans the archive for existing files with the given prefix and date, and returns the next
    /// sequence number.
    async fn next_sequence_number(&self, prefix: &str, date: &str) -> Res<u32> {
        let mut max_seq: u32 = 0;
        for name in self.archive_names().await? {
            if let Some(seq) = parse_sequence_number(&name, prefix, date) {
                max_seq = max_seq.max(seq);
            }
        }
        Ok(max_seq + 1)
    }

    /// Deletes the oldest archives, keeping only `archive_copies` files with the given prefix.
    async fn rotate(&self, prefix: &str) -> Res<()> {
        let mut files: Vec<String> = self
            .archive_names()
            .await?
            .into_iter()
            .filter(|name| is_archive_file(name, prefix))
            .collect();

        // Sorting by name sorts by date and sequence number due to the format.
        files.sort();

        let to_delete = files.len().saturating_sub(self.archive_copies as usize);
        for name in files.into_iter().take(to_delete) {
            utils::remove(&self.archive_dir.join(name)).await?;
        }
        Ok(())
    }

    async fn archive_names(&self) -> Res<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = utils::read_dir(&self.archive_dir).await?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .context("Failed to read directory entry")?
        {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        Ok(names)
    }
}

/// Returns today's date in YYYY-MM-DD format.
fn today() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

/// Parses the sequence number from an archive filename.
/// Returns None if the filename doesn't match `{prefix}.{date}-{NNN}.json`.
fn parse_sequence_number(filename: &str, prefix: &str, date: &str) -> Option<u32> {
    let remainder = filename.strip_prefix(&format!("{prefix}.{date}-"))?;
    remainder.strip_suffix(".json")?.parse().ok()
}

fn is_archive_file(filename: &str, prefix: &str) -> bool {
    filename.starts_with(&format!("{prefix}.")) && filename.ends_with(".json")
}
