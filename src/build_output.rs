//! Build output lifecycle: clean the output directory before rendering, then
//! capture what the renderer wrote as an immutable, content-addressed snapshot.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

/// SHA-256 content address of a build output tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(String);

impl BuildId {
    /// Accepts only a full lowercase hex SHA-256.
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit());
        valid.then(|| BuildId(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("build output directory {0} does not exist")]
    Missing(PathBuf),
    #[error("build output directory {0} is empty")]
    Empty(PathBuf),
    #[error("build output path {0} is not valid UTF-8")]
    NonUtf8Path(PathBuf),
    #[error("failed to read build output: {0}")]
    Io(#[from] io::Error),
}

/// Snapshot of a rendered site: relative `/`-separated path to file bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    root: PathBuf,
    files: BTreeMap<String, Vec<u8>>,
    build_id: BuildId,
}

impl BuildOutput {
    pub fn from_files(root: impl Into<PathBuf>, files: BTreeMap<String, Vec<u8>>) -> Self {
        let build_id = compute_build_id(&files);
        Self {
            root: root.into(),
            files,
            build_id,
        }
    }

    /// Read every file under `dir`. `.git` directories are skipped.
    pub fn capture(dir: &Path) -> Result<Self, CaptureError> {
        if !dir.is_dir() {
            error!(path = %dir.display(), "Build output directory missing after render");
            return Err(CaptureError::Missing(dir.to_path_buf()));
        }
        let mut files = BTreeMap::new();
        visit(dir, dir, &mut files)?;
        if files.is_empty() {
            error!(path = %dir.display(), "Renderer produced no files");
            return Err(CaptureError::Empty(dir.to_path_buf()));
        }
        let output = Self::from_files(dir, files);
        info!(
            path = %dir.display(),
            files = output.len(),
            bytes = output.total_bytes(),
            build_id = %output.build_id.short(),
            "Captured build output"
        );
        Ok(output)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.files
    }

    pub fn build_id(&self) -> &BuildId {
        &self.build_id
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|c| c.len() as u64).sum()
    }

    /// `(path, sha256 hex, size)` for every file, in path order.
    pub fn digests(&self) -> Vec<(String, String, u64)> {
        self.files
            .iter()
            .map(|(path, content)| (path.clone(), sha256_hex(content), content.len() as u64))
            .collect()
    }

    /// Materialise the snapshot under `dir`, creating parent directories.
    pub fn write_to(&self, dir: &Path) -> io::Result<()> {
        for (rel, content) in &self.files {
            let dest = dir.join(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dest, content)?;
        }
        debug!(path = %dir.display(), files = self.files.len(), "Wrote build output");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("build output directory `{output_dir}` would overlap the source tree at {source_root}")]
pub struct UnsafeOutputDir {
    pub output_dir: PathBuf,
    pub source_root: PathBuf,
}

/// Where the renderer writes: `output_dir` under `source_root` unless it is
/// absolute. Locations whose cleaning would delete the source tree (the root
/// itself, an ancestor, or anything reached through `..`) are rejected.
pub fn resolve_output_dir(output_dir: &Path, source_root: &Path) -> Result<PathBuf, UnsafeOutputDir> {
    let escapes = output_dir.components().any(|c| c == Component::ParentDir);
    let names_a_dir = output_dir.is_absolute()
        || output_dir.components().any(|c| matches!(c, Component::Normal(_)));
    let path = if output_dir.is_absolute() {
        output_dir.to_path_buf()
    } else {
        source_root.join(output_dir)
    };
    if escapes || !names_a_dir || source_root.starts_with(&path) {
        error!(
            output_dir = %output_dir.display(),
            source_root = %source_root.display(),
            "Refusing build output directory that overlaps the source tree"
        );
        return Err(UnsafeOutputDir {
            output_dir: output_dir.to_path_buf(),
            source_root: source_root.to_path_buf(),
        });
    }
    Ok(path)
}

/// Remove a stale output directory. Returns whether anything was removed.
pub fn clean(dir: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(dir) {
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(dir)?;
            info!(path = %dir.display(), "Removed stale build output");
            Ok(true)
        }
        Ok(_) => {
            fs::remove_file(dir)?;
            info!(path = %dir.display(), "Removed stale build output file");
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %dir.display(), "No previous build output to clean");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

fn visit(dir: &Path, root: &Path, files: &mut BTreeMap<String, Vec<u8>>) -> Result<(), CaptureError> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            if path.file_name().and_then(|n| n.to_str()) == Some(".git") {
                debug!(path = %path.display(), "Skipping .git directory in build output");
                continue;
            }
            visit(&path, root, files)?;
        } else if path.is_file() {
            let rel = path
                .strip_prefix(root)
                .map_err(|_| CaptureError::NonUtf8Path(path.clone()))?;
            let segments = rel
                .components()
                .map(|c| c.as_os_str().to_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| CaptureError::NonUtf8Path(path.clone()))?;
            files.insert(segments.join("/"), fs::read(&path)?);
        }
    }
    Ok(())
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn compute_build_id(files: &BTreeMap<String, Vec<u8>>) -> BuildId {
    let mut hasher = Sha256::new();
    for (path, content) in files {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(sha256_hex(content).as_bytes());
        hasher.update([b'\n']);
    }
    BuildId(hex::encode(hasher.finalize()))
}
