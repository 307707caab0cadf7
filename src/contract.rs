//! # contract: the seams between the pipeline controller and its collaborators
//!
//! The controller drives three collaborators, each behind a trait so real
//! implementations (git, a site generator binary) and test mocks are
//! interchangeable:
//!
//! - [`Acquirer`]: checks out the source tree for a trigger event.
//! - [`Renderer`]: the external static-site generator, a black box that turns
//!   the source tree plus a theme into an output directory.
//! - [`Publisher`]: replaces the published tree of a target branch with a
//!   build output.
//!
//! The traits are annotated for `mockall`; with the `test-export-mocks`
//! feature (on by default) the generated `Mock*` types are exported so
//! integration tests can use them too.

use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::build_output::{BuildId, BuildOutput, CaptureError};
use crate::exec::ExecError;
use crate::trigger::TriggerEvent;

/// How much commit history the checkout carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryDepth {
    Full,
    /// History is truncated; generator metadata derived from commit history
    /// (per-page last-modified dates) will be wrong.
    Shallow,
}

/// A checked-out source tree, fixed for the duration of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSnapshot {
    pub root: PathBuf,
    pub branch: String,
    /// Resolved commit id of the checkout.
    pub commit: String,
    pub history: HistoryDepth,
}

/// Named theme the renderer is invoked with, and where its sub-tree lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThemeReference {
    pub name: String,
    /// Relative to the source root.
    pub dir: PathBuf,
}

impl ThemeReference {
    /// `dir` defaults to `themes/<name>`.
    pub fn new(name: impl Into<String>, dir: Option<PathBuf>) -> Self {
        let name = name.into();
        let dir = dir.unwrap_or_else(|| Path::new("themes").join(&name));
        Self { name, dir }
    }

    /// The theme must exist as a non-empty directory inside the checkout.
    pub fn resolve(&self, root: &Path) -> Result<PathBuf, AcquireError> {
        let path = root.join(&self.dir);
        let populated = std::fs::read_dir(&path)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if populated {
            Ok(path)
        } else {
            Err(AcquireError::ThemeUnresolved {
                theme: self.name.clone(),
                path,
            })
        }
    }
}

/// Secret used to authenticate the publish push. Never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct DeployCredential(String);

impl DeployCredential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Write the key to a private temp file for `ssh -i`. The file is removed
    /// when the returned handle drops.
    pub fn write_key_file(&self) -> io::Result<tempfile::NamedTempFile> {
        let mut file = tempfile::Builder::new().prefix("deploy-key-").tempfile()?;
        file.write_all(self.0.trim_end().as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(file)
    }
}

impl fmt::Debug for DeployCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeployCredential(<redacted>)")
    }
}

/// Repository and branch that receive the published site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishTarget {
    /// `<owner>/<repo>`, a full URL, or a local path.
    pub repository: String,
    pub branch: String,
}

impl PublishTarget {
    pub fn new(repository: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            branch: branch.into(),
        }
    }

    /// `<owner>/<repo>` shorthand resolves to an SSH remote on `host`;
    /// anything else is used verbatim.
    pub fn remote_url(&self, host: &str) -> String {
        let repo = self.repository.as_str();
        let is_shorthand = !repo.contains("://")
            && !repo.contains(':')
            && !repo.starts_with('/')
            && !repo.starts_with('.')
            && repo.split('/').count() == 2
            && repo.split('/').all(|part| !part.is_empty());
        if !is_shorthand {
            return repo.to_string();
        }
        let suffix = if repo.ends_with(".git") { "" } else { ".git" };
        format!("git@{host}:{repo}{suffix}")
    }

    /// Stable key for per-target locking: `owner_repo@branch`, filename safe.
    pub fn key(&self) -> String {
        format!("{}@{}", self.repository, self.branch)
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '@') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for PublishTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repository, self.branch)
    }
}

/// Outcome of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub target: PublishTarget,
    pub build_id: BuildId,
    /// Tip of the target branch after publishing.
    pub commit: String,
    /// False only when the tree was unchanged and empty commits are disabled.
    pub pushed: bool,
}

/// What the renderer reported on success.
#[derive(Debug, Clone, Default)]
pub struct RenderReport {
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("git {step} failed with exit code {code:?}: {stderr}")]
    Git {
        step: &'static str,
        code: Option<i32>,
        stderr: String,
    },
    #[error("theme `{theme}` did not resolve to a populated directory at {path}")]
    ThemeUnresolved { theme: String, path: PathBuf },
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("workspace error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("renderer exited with code {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Output(#[from] CaptureError),
}

impl RenderError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RenderError::Exited { code, .. } => *code,
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("git {step} failed with exit code {code:?}: {stderr}")]
    Git {
        step: &'static str,
        code: Option<i32>,
        stderr: String,
    },
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("publish workspace error: {0}")]
    Io(#[from] io::Error),
}

impl PublishError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            PublishError::Git { code, .. } => *code,
            _ => None,
        }
    }
}

/// Fetches the source tree (with the configured history depth) for a trigger.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Acquirer: Send + Sync {
    async fn acquire(&self, event: &TriggerEvent) -> Result<SourceSnapshot, AcquireError>;
}

/// External static-site generator.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render `source` with `theme` into `output_dir`. Must fail when the
    /// generator exits non-zero.
    async fn render(
        &self,
        source: &SourceSnapshot,
        theme: &ThemeReference,
        output_dir: &Path,
    ) -> Result<RenderReport, RenderError>;
}

/// Replaces the content of a target branch with a build output.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// On success the target branch tip's tree equals `output` exactly.
    async fn publish(
        &self,
        output: &BuildOutput,
        credential: &DeployCredential,
        target: &PublishTarget,
        source_commit: &str,
    ) -> Result<PublishReceipt, PublishError>;
}
