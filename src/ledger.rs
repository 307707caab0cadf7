//! Build ledger: every run's intended output is archived under its build id
//! before the target branch is overwritten, so past builds can be audited
//! and republished.
//!
//! Layout: `<dir>/<build_id>/manifest.json` and `<dir>/<build_id>/tree/...`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::build_output::{BuildId, BuildOutput, CaptureError};

const MANIFEST_FILE: &str = "manifest.json";
const TREE_DIR: &str = "tree";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub sha256: String,
    pub size: u64,
}

/// Inspectable description of one build output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildManifest {
    pub build_id: BuildId,
    pub run_id: Uuid,
    pub source_commit: String,
    pub branch: String,
    pub created_at: DateTime<Utc>,
    pub files: Vec<ManifestEntry>,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("`{0}` is not a valid build id")]
    InvalidId(String),
    #[error("build {0} is not in the ledger")]
    NotFound(String),
    #[error("archived build {expected} is corrupt (tree hashes to {actual})")]
    Corrupt { expected: BuildId, actual: BuildId },
    #[error("malformed manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("ledger I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct BuildLedger {
    dir: PathBuf,
    keep: Option<usize>,
}

impl BuildLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            keep: None,
        }
    }

    /// Prune to the newest `keep` builds whenever a new build is recorded.
    pub fn with_retention(mut self, keep: Option<usize>) -> Self {
        self.keep = keep;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Archive `output`. Recording a build id that is already present returns
    /// the existing manifest untouched.
    pub fn record(
        &self,
        output: &BuildOutput,
        run_id: Uuid,
        source_commit: &str,
        branch: &str,
    ) -> Result<BuildManifest, LedgerError> {
        let final_dir = self.dir.join(output.build_id().as_str());
        if final_dir.join(MANIFEST_FILE).is_file() {
            debug!(build_id = %output.build_id().short(), "Build already archived");
            return self.read_manifest(&final_dir);
        }
        fs::create_dir_all(&self.dir)?;

        let manifest = BuildManifest {
            build_id: output.build_id().clone(),
            run_id,
            source_commit: source_commit.to_string(),
            branch: branch.to_string(),
            created_at: Utc::now(),
            files: output
                .digests()
                .into_iter()
                .map(|(path, sha256, size)| ManifestEntry { path, sha256, size })
                .collect(),
        };

        let staging = tempfile::Builder::new()
            .prefix(".incoming-")
            .tempdir_in(&self.dir)?;
        let staging_path = staging.path().to_path_buf();
        output.write_to(&staging_path.join(TREE_DIR))?;
        let json = serde_json::to_vec_pretty(&manifest).map_err(|source| LedgerError::Manifest {
            path: staging_path.join(MANIFEST_FILE),
            source,
        })?;
        fs::write(staging_path.join(MANIFEST_FILE), json)?;
        // The staging guard's cleanup is a no-op once the rename has moved it.
        fs::rename(&staging_path, &final_dir)?;
        drop(staging);

        info!(
            build_id = %manifest.build_id.short(),
            files = manifest.files.len(),
            path = %final_dir.display(),
            "Archived build output"
        );
        if let Some(keep) = self.keep {
            self.prune(keep)?;
        }
        Ok(manifest)
    }

    /// Delete all but the newest `keep` archived builds; returns what was removed.
    pub fn prune(&self, keep: usize) -> Result<Vec<BuildId>, LedgerError> {
        let mut removed = Vec::new();
        for manifest in self.list()?.into_iter().skip(keep) {
            fs::remove_dir_all(self.dir.join(manifest.build_id.as_str()))?;
            removed.push(manifest.build_id);
        }
        if !removed.is_empty() {
            info!(kept = keep, removed = removed.len(), "Pruned build ledger");
        }
        Ok(removed)
    }

    /// All archived manifests, newest first.
    pub fn list(&self) -> Result<Vec<BuildManifest>, LedgerError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut manifests = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_build = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(BuildId::parse)
                .is_some();
            if !is_build || !path.join(MANIFEST_FILE).is_file() {
                continue;
            }
            match self.read_manifest(&path) {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable manifest"),
            }
        }
        manifests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(manifests)
    }

    /// Reconstruct an archived build, verifying its content address.
    pub fn load(&self, build_id: &str) -> Result<(BuildManifest, BuildOutput), LedgerError> {
        let id = BuildId::parse(build_id).ok_or_else(|| LedgerError::InvalidId(build_id.to_string()))?;
        let dir = self.dir.join(id.as_str());
        if !dir.join(MANIFEST_FILE).is_file() {
            return Err(LedgerError::NotFound(id.to_string()));
        }
        let manifest = self.read_manifest(&dir)?;
        let output = BuildOutput::capture(&dir.join(TREE_DIR))?;
        if output.build_id() != &id {
            return Err(LedgerError::Corrupt {
                expected: id,
                actual: output.build_id().clone(),
            });
        }
        Ok((manifest, output))
    }

    fn read_manifest(&self, build_dir: &Path) -> Result<BuildManifest, LedgerError> {
        let path = build_dir.join(MANIFEST_FILE);
        let raw = fs::read(&path)?;
        serde_json::from_slice(&raw).map_err(|source| LedgerError::Manifest { path, source })
    }
}
