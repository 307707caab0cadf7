//! Checks out the content repository for one trigger.
//!
//! Every run starts from an empty work directory: the repository is cloned,
//! detached at the pushed commit, and theme submodules are initialised. A
//! `fetch_depth` above zero produces a shallow checkout, reported as
//! [`HistoryDepth::Shallow`] so the controller can warn about history-derived
//! page metadata.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::contract::{AcquireError, Acquirer, HistoryDepth, SourceSnapshot, ThemeReference};
use crate::exec::{self, CommandOutput};
use crate::trigger::TriggerEvent;

/// Where the content repository lives and how to check it out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSettings {
    pub repo_url: String,
    /// Checkout location; wiped at the start of every run.
    #[serde(default = "default_source_workdir")]
    pub workdir: PathBuf,
    /// Fetch theme sub-trees.
    #[serde(default = "default_true")]
    pub submodules: bool,
    /// 0 = full history.
    #[serde(default)]
    pub fetch_depth: u32,
}

fn default_source_workdir() -> PathBuf {
    PathBuf::from("./work/source")
}

fn default_true() -> bool {
    true
}

/// Clones the content repository fresh for every run.
pub struct GitAcquirer {
    settings: SourceSettings,
    theme: ThemeReference,
}

impl GitAcquirer {
    pub fn new(settings: SourceSettings, theme: ThemeReference) -> Self {
        Self { settings, theme }
    }

    /// Wipe any previous checkout; returns the absolute checkout path.
    fn prepare_workdir(&self) -> Result<PathBuf, AcquireError> {
        let workdir = absolute(&self.settings.workdir)?;
        if workdir.exists() {
            fs::remove_dir_all(&workdir).map_err(|e| {
                error!(error = ?e, path = %workdir.display(), "Failed to remove previous checkout");
                e
            })?;
            debug!(path = %workdir.display(), "Removed previous checkout");
        }
        if let Some(parent) = workdir.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(workdir)
    }
}

#[async_trait]
impl Acquirer for GitAcquirer {
    async fn acquire(&self, event: &TriggerEvent) -> Result<SourceSnapshot, AcquireError> {
        let settings = &self.settings;
        let workdir = self.prepare_workdir()?;
        let parent = workdir.parent().map(Path::to_path_buf).unwrap_or_else(|| workdir.clone());

        let mut clone_args = vec!["clone".to_string(), "--branch".to_string(), event.branch.clone()];
        if settings.fetch_depth > 0 {
            warn!(
                fetch_depth = settings.fetch_depth,
                "Shallow fetch requested; history-derived page metadata will be incorrect"
            );
            clone_args.push("--depth".to_string());
            clone_args.push(settings.fetch_depth.to_string());
        }
        clone_args.push(settings.repo_url.clone());
        clone_args.push(workdir.to_string_lossy().into_owned());

        checked("clone", exec::git(&parent, &clone_args, &[]).await?)?;
        info!(
            repo_url = %settings.repo_url,
            branch = %event.branch,
            path = %workdir.display(),
            "Cloned source repository"
        );

        checked(
            "checkout",
            exec::git(&workdir, &["checkout", "--detach", event.commit.as_str()], &[]).await?,
        )?;
        debug!(commit = %event.commit, "Checked out trigger commit");

        if settings.submodules {
            checked(
                "submodule update",
                exec::git(&workdir, &["submodule", "update", "--init", "--recursive"], &[]).await?,
            )?;
            debug!("Initialised submodules");
        }

        let head = checked("rev-parse", exec::git(&workdir, &["rev-parse", "HEAD"], &[]).await?)?;
        let shallow = checked(
            "rev-parse --is-shallow-repository",
            exec::git(&workdir, &["rev-parse", "--is-shallow-repository"], &[]).await?,
        )?;
        let history = if shallow.stdout.trim() == "true" {
            HistoryDepth::Shallow
        } else {
            HistoryDepth::Full
        };

        let theme_path = self.theme.resolve(&workdir).map_err(|e| {
            error!(theme = %self.theme.name, error = %e, "Theme did not resolve");
            e
        })?;

        let snapshot = SourceSnapshot {
            root: workdir,
            branch: event.branch.clone(),
            commit: head.stdout.trim().to_string(),
            history,
        };
        info!(
            commit = %snapshot.commit,
            history = ?snapshot.history,
            theme = %theme_path.display(),
            "Source tree acquired"
        );
        Ok(snapshot)
    }
}

fn checked(step: &'static str, output: CommandOutput) -> Result<CommandOutput, AcquireError> {
    if output.success() {
        return Ok(output);
    }
    error!(step, code = ?output.code, stderr = %output.stderr, "git exited with non-zero code");
    Err(AcquireError::Git {
        step,
        code: output.code,
        stderr: output.stderr_tail(),
    })
}

fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
