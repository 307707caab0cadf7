//! Publishes a build output by committing it as the complete tree of a branch
//! in the hosting repository and pushing with the deploy key.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::build_output::BuildOutput;
use crate::contract::{DeployCredential, PublishError, PublishReceipt, PublishTarget, Publisher};
use crate::exec::{self, CommandOutput};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishSettings {
    /// `<owner>/<repo>`, a full git URL, or a local path.
    pub external_repository: String,
    pub publish_branch: String,
    #[serde(default = "default_git_host")]
    pub git_host: String,
    /// Scratch clone of the target branch; wiped before every publish.
    #[serde(default = "default_publish_workdir")]
    pub workdir: PathBuf,
    #[serde(default = "default_user_name")]
    pub user_name: String,
    #[serde(default = "default_user_email")]
    pub user_email: String,
    /// Commit and push even when the published tree is unchanged.
    #[serde(default = "default_allow_empty_commit")]
    pub allow_empty_commit: bool,
}

impl PublishSettings {
    pub fn target(&self) -> PublishTarget {
        PublishTarget::new(&self.external_repository, &self.publish_branch)
    }
}

fn default_git_host() -> String {
    "github.com".to_string()
}

fn default_publish_workdir() -> PathBuf {
    PathBuf::from("./work/publish")
}

fn default_user_name() -> String {
    "github-actions[bot]".to_string()
}

fn default_user_email() -> String {
    "github-actions[bot]@users.noreply.github.com".to_string()
}

fn default_allow_empty_commit() -> bool {
    true
}

pub struct GitPublisher {
    settings: PublishSettings,
}

impl GitPublisher {
    pub fn new(settings: PublishSettings) -> Self {
        Self { settings }
    }

    fn commit_args(&self, message: &str, allow_empty: bool) -> Vec<String> {
        let mut args = exact_tree_args(&[]);
        args.extend([
            "-c".to_string(),
            format!("user.name={}", self.settings.user_name),
            "-c".to_string(),
            format!("user.email={}", self.settings.user_email),
            "-c".to_string(),
            "commit.gpgsign=false".to_string(),
            "commit".to_string(),
            "--quiet".to_string(),
            "-m".to_string(),
            message.to_string(),
        ]);
        if allow_empty {
            args.push("--allow-empty".to_string());
        }
        args
    }
}

#[async_trait]
impl Publisher for GitPublisher {
    async fn publish(
        &self,
        output: &BuildOutput,
        credential: &DeployCredential,
        target: &PublishTarget,
        source_commit: &str,
    ) -> Result<PublishReceipt, PublishError> {
        let url = target.remote_url(&self.settings.git_host);
        let key_file = credential.write_key_file()?;
        let auth = vec![("GIT_SSH_COMMAND".to_string(), ssh_command(key_file.path()))];
        info!(
            target = %target,
            build_id = %output.build_id().short(),
            files = output.len(),
            "[PUBLISH] Publishing build output"
        );

        let workdir = absolute(&self.settings.workdir)?;
        if workdir.exists() {
            fs::remove_dir_all(&workdir)?;
            debug!(path = %workdir.display(), "[PUBLISH] Removed previous publish workdir");
        }
        let parent = workdir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        fs::create_dir_all(&parent)?;
        let workdir_arg = workdir.to_string_lossy().into_owned();

        let head_ref = format!("refs/heads/{}", target.branch);
        let heads = checked(
            "ls-remote",
            exec::git(&parent, &["ls-remote", "--heads", url.as_str(), head_ref.as_str()], &auth).await?,
        )?;
        let branch_exists = lists_ref(&heads.stdout, &head_ref);

        if branch_exists {
            checked(
                "clone",
                exec::git(
                    &parent,
                    &[
                        "clone",
                        "--quiet",
                        "--depth",
                        "1",
                        "--branch",
                        target.branch.as_str(),
                        url.as_str(),
                        workdir_arg.as_str(),
                    ],
                    &auth,
                )
                .await?,
            )?;
            debug!(target = %target, "[PUBLISH] Cloned target branch");
        } else {
            info!(target = %target, "[PUBLISH] Target branch does not exist yet, starting new history");
            fs::create_dir_all(&workdir)?;
            checked("init", exec::git(&workdir, &["init", "--quiet"], &[]).await?)?;
            checked(
                "symbolic-ref",
                exec::git(&workdir, &["symbolic-ref", "HEAD", head_ref.as_str()], &[]).await?,
            )?;
            checked(
                "remote add",
                exec::git(&workdir, &["remote", "add", "origin", url.as_str()], &[]).await?,
            )?;
        }

        let removed = clear_worktree(&workdir)?;
        debug!(removed, "[PUBLISH] Cleared previously published files");
        output.write_to(&workdir)?;
        checked(
            "add",
            exec::git(&workdir, &exact_tree_args(&["add", "--all", "--force"]), &[]).await?,
        )?;

        let status = checked(
            "status",
            exec::git(&workdir, &exact_tree_args(&["status", "--porcelain"]), &[]).await?,
        )?;
        let changed = !status.stdout.trim().is_empty();

        if !changed && branch_exists && !self.settings.allow_empty_commit {
            let head = checked("rev-parse", exec::git(&workdir, &["rev-parse", "HEAD"], &[]).await?)?;
            info!(target = %target, "[PUBLISH] Published tree unchanged, skipping push");
            return Ok(PublishReceipt {
                target: target.clone(),
                build_id: output.build_id().clone(),
                commit: head.stdout.trim().to_string(),
                pushed: false,
            });
        }

        let message = format!("deploy: {source_commit}\n\nBuild-Id: {}", output.build_id());
        checked(
            "commit",
            exec::git(&workdir, &self.commit_args(&message, !changed), &[]).await?,
        )?;
        let refspec = format!("HEAD:refs/heads/{}", target.branch);
        checked(
            "push",
            exec::git(&workdir, &["push", "--quiet", "origin", refspec.as_str()], &auth).await?,
        )?;
        let head = checked("rev-parse", exec::git(&workdir, &["rev-parse", "HEAD"], &[]).await?)?;

        let receipt = PublishReceipt {
            target: target.clone(),
            build_id: output.build_id().clone(),
            commit: head.stdout.trim().to_string(),
            pushed: true,
        };
        info!(target = %target, commit = %receipt.commit, "[PUBLISH] Pushed build output");
        Ok(receipt)
    }
}

fn checked(step: &'static str, output: CommandOutput) -> Result<CommandOutput, PublishError> {
    if output.success() {
        return Ok(output);
    }
    error!(step, code = ?output.code, stderr = %output.stderr, "[PUBLISH] git exited with non-zero code");
    Err(PublishError::Git {
        step,
        code: output.code,
        stderr: output.stderr_tail(),
    })
}

/// Prefix `args` with config overrides so the committed tree is byte-for-byte
/// the build output: no ignore rules from the runner, no line-ending rewrites.
fn exact_tree_args(args: &[&str]) -> Vec<String> {
    ["-c", "core.autocrlf=false", "-c", "core.excludesFile=/dev/null", "-c", "core.safecrlf=false"]
        .iter()
        .chain(args)
        .map(|a| a.to_string())
        .collect()
}

/// `ls-remote` patterns match on ref suffix; only an exact ref name counts.
fn lists_ref(ls_remote: &str, full_ref: &str) -> bool {
    ls_remote
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|name| name == full_ref)
}

fn ssh_command(key_path: &Path) -> String {
    let quoted = key_path.to_string_lossy().replace('\'', r"'\''");
    format!("ssh -i '{quoted}' -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new")
}

/// Delete everything in `dir` except the `.git` directory.
fn clear_worktree(dir: &Path) -> std::io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name() == ".git" {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        removed += 1;
    }
    Ok(removed)
}

fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
