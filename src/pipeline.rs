//! High-level pipeline: acquire → clean → render → publish, once per trigger.
//!
//! The controller owns trigger filtering, step ordering and failure
//! propagation. Steps run strictly in sequence; each step's success is the
//! precondition for the next, and the first failure ends the run:
//!
//! ```text
//! Idle → Triggered → Acquiring → Cleaning → Rendering → Publishing → Succeeded
//!                                                                  ↘ Failed(stage)
//! ```
//!
//! A push to a branch outside the allow-list is not an error: the run is
//! skipped without side effects. Nothing is retried and nothing is rolled
//! back; a failed publish may leave the target branch as the push left it.
//!
//! Runs that share a publish target hold a [`TargetLock`] for their whole
//! duration, and each build output is archived in the [`BuildLedger`] (when
//! configured) before the target branch is overwritten.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::acquire::GitAcquirer;
use crate::build_output::{self, BuildId, BuildOutput, UnsafeOutputDir};
use crate::config::SiteConfig;
use crate::contract::{
    AcquireError, Acquirer, DeployCredential, HistoryDepth, PublishError, PublishReceipt,
    PublishTarget, Publisher, RenderError, Renderer, ThemeReference,
};
use crate::ledger::{BuildLedger, LedgerError};
use crate::lock::{LockError, LockSettings, TargetLock};
use crate::publish::GitPublisher;
use crate::render::CommandRenderer;
use crate::trigger::{BranchFilter, TriggerError, TriggerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Trigger,
    Acquire,
    Clean,
    Render,
    Publish,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Trigger => "trigger",
            Stage::Acquire => "acquire",
            Stage::Clean => "clean",
            Stage::Render => "render",
            Stage::Publish => "publish",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    Triggered,
    Acquiring,
    Cleaning,
    Rendering,
    Publishing,
    Succeeded,
    Failed(Stage),
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed(_))
    }

    /// Legal transitions: one step forward, or from any live state to Failed.
    pub fn can_advance_to(&self, next: RunState) -> bool {
        use RunState::*;
        let forward = matches!(
            (self, next),
            (Idle, Triggered)
                | (Triggered, Acquiring)
                | (Acquiring, Cleaning)
                | (Cleaning, Rendering)
                | (Rendering, Publishing)
                | (Publishing, Succeeded)
        );
        let failing = matches!(next, Failed(_)) && !self.is_terminal() && *self != Idle;
        forward || failing
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Failed(stage) => write!(f, "Failed({stage})"),
            other => write!(f, "{other:?}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("deploy credential is missing or empty")]
    MissingCredential,
    #[error("publish target is busy: {0}")]
    Busy(#[from] LockError),
    #[error("acquisition failed: {0}")]
    Acquisition(#[from] AcquireError),
    #[error(transparent)]
    UnsafeOutputDir(#[from] UnsafeOutputDir),
    #[error("failed to clean build output {path}: {source}")]
    Clean {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("render failed: {0}")]
    Render(#[from] RenderError),
    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),
    #[error("build ledger: {0}")]
    Ledger(#[from] LedgerError),
    #[error("no build ledger is configured")]
    LedgerDisabled,
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::MissingCredential | PipelineError::Busy(_) => Stage::Trigger,
            PipelineError::Acquisition(_) => Stage::Acquire,
            PipelineError::UnsafeOutputDir(_) | PipelineError::Clean { .. } => Stage::Clean,
            PipelineError::Render(_) => Stage::Render,
            PipelineError::Publish(_) | PipelineError::Ledger(_) | PipelineError::LedgerDisabled => {
                Stage::Publish
            }
        }
    }

    /// Process exit status: the failing step's own code when it has one.
    pub fn exit_code(&self) -> i32 {
        let code = match self {
            PipelineError::Render(e) => e.exit_code(),
            PipelineError::Publish(e) => e.exit_code(),
            _ => None,
        };
        match code {
            Some(c) if (1..=255).contains(&c) => c,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub trigger: TriggerEvent,
    pub source_commit: String,
    pub history: HistoryDepth,
    pub build_id: BuildId,
    pub file_count: usize,
    pub receipt: PublishReceipt,
    pub transitions: Vec<RunState>,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The pushed branch is not in the allow-list; nothing happened.
    Skipped { branch: String },
    Completed(RunReport),
}

/// Everything the controller needs besides its three collaborators.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub theme: ThemeReference,
    /// Relative to the source root unless absolute.
    pub output_dir: PathBuf,
    pub target: PublishTarget,
    pub credential: Option<DeployCredential>,
    pub ledger: Option<BuildLedger>,
    pub lock: Option<LockSettings>,
}

pub struct Pipeline<A, R, P> {
    filter: BranchFilter,
    acquirer: A,
    renderer: R,
    publisher: P,
    settings: PipelineSettings,
}

impl Pipeline<GitAcquirer, CommandRenderer, GitPublisher> {
    /// Wire the git/command-line collaborators from a loaded config.
    pub fn from_config(
        config: &SiteConfig,
        credential: Option<DeployCredential>,
    ) -> Result<Self, TriggerError> {
        let filter = BranchFilter::new(&config.trigger.branches)?;
        let theme = config.theme.reference();
        let settings = PipelineSettings {
            theme: theme.clone(),
            output_dir: config.render.output_dir.clone(),
            target: config.publish.target(),
            credential,
            ledger: config
                .ledger
                .as_ref()
                .map(|l| BuildLedger::new(&l.dir).with_retention(l.keep)),
            lock: Some(config.lock.clone()),
        };
        Ok(Pipeline::new(
            filter,
            GitAcquirer::new(config.source.clone(), theme),
            CommandRenderer::new(config.render.clone()),
            GitPublisher::new(config.publish.clone()),
            settings,
        ))
    }
}

impl<A, R, P> Pipeline<A, R, P>
where
    A: Acquirer,
    R: Renderer,
    P: Publisher,
{
    pub fn new(
        filter: BranchFilter,
        acquirer: A,
        renderer: R,
        publisher: P,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            filter,
            acquirer,
            renderer,
            publisher,
            settings,
        }
    }

    pub fn target(&self) -> &PublishTarget {
        &self.settings.target
    }

    pub fn ledger(&self) -> Option<&BuildLedger> {
        self.settings.ledger.as_ref()
    }

    /// Handle one trigger event.
    pub async fn run(&self, event: TriggerEvent) -> Result<RunOutcome, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, branch = %event.branch);
        self.run_inner(run_id, event).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, event: TriggerEvent) -> Result<RunOutcome, PipelineError> {
        if !self.filter.matches(&event.branch) {
            info!(
                branch = %event.branch,
                allowed = ?self.filter.patterns().collect::<Vec<_>>(),
                "[RUN] Branch not in allow-list, ignoring trigger"
            );
            return Ok(RunOutcome::Skipped {
                branch: event.branch,
            });
        }

        let mut tracker = RunTracker::new(run_id);
        tracker.advance(RunState::Triggered);

        let Some(credential) = self.credential() else {
            return Err(tracker.fail(Stage::Trigger, PipelineError::MissingCredential));
        };
        let _lock = self
            .lock_target(run_id)
            .await
            .map_err(|e| tracker.fail(Stage::Trigger, e))?;

        // Step 1: acquire
        tracker.advance(RunState::Acquiring);
        let source = self
            .acquirer
            .acquire(&event)
            .await
            .map_err(|e| tracker.fail(Stage::Acquire, e))?;
        if source.history == HistoryDepth::Shallow {
            warn!(
                commit = %source.commit,
                "[RUN] Source history is shallow; per-page last-modified metadata will be incorrect"
            );
        }

        // Step 2: clean
        tracker.advance(RunState::Cleaning);
        let output_dir = build_output::resolve_output_dir(&self.settings.output_dir, &source.root)
            .map_err(|e| tracker.fail(Stage::Clean, e))?;
        build_output::clean(&output_dir).map_err(|e| {
            tracker.fail(
                Stage::Clean,
                PipelineError::Clean {
                    path: output_dir.clone(),
                    source: e,
                },
            )
        })?;

        // Step 3: render
        tracker.advance(RunState::Rendering);
        self.renderer
            .render(&source, &self.settings.theme, &output_dir)
            .await
            .map_err(|e| tracker.fail(Stage::Render, e))?;
        let output = BuildOutput::capture(&output_dir)
            .map_err(|e| tracker.fail(Stage::Render, RenderError::from(e)))?;

        // Step 4: publish
        tracker.advance(RunState::Publishing);
        if let Some(ledger) = &self.settings.ledger {
            ledger
                .record(&output, run_id, &source.commit, &source.branch)
                .map_err(|e| tracker.fail(Stage::Publish, e))?;
        }
        let receipt = self
            .publisher
            .publish(&output, credential, &self.settings.target, &source.commit)
            .await
            .map_err(|e| tracker.fail(Stage::Publish, e))?;

        tracker.advance(RunState::Succeeded);
        info!(
            build_id = %output.build_id().short(),
            commit = %receipt.commit,
            pushed = receipt.pushed,
            "[RUN] Pipeline completed successfully"
        );

        Ok(RunOutcome::Completed(RunReport {
            run_id,
            trigger: event,
            source_commit: source.commit,
            history: source.history,
            build_id: output.build_id().clone(),
            file_count: output.len(),
            receipt,
            transitions: tracker.states,
        }))
    }

    /// Publish an archived build again without re-rendering.
    pub async fn republish(&self, build_id: &str) -> Result<PublishReceipt, PipelineError> {
        let ledger = self.settings.ledger.as_ref().ok_or(PipelineError::LedgerDisabled)?;
        let credential = self.credential().ok_or(PipelineError::MissingCredential)?;
        let (manifest, output) = ledger.load(build_id)?;

        let run_id = Uuid::new_v4();
        let _lock = self.lock_target(run_id).await?;
        info!(
            %run_id,
            build_id = %manifest.build_id.short(),
            source_commit = %manifest.source_commit,
            "[REPUBLISH] Publishing archived build"
        );
        let receipt = self
            .publisher
            .publish(&output, credential, &self.settings.target, &manifest.source_commit)
            .await
            .map_err(|e| {
                error!(error = %e, "[REPUBLISH] Publish failed");
                e
            })?;
        Ok(receipt)
    }

    fn credential(&self) -> Option<&DeployCredential> {
        self.settings.credential.as_ref().filter(|c| !c.is_empty())
    }

    async fn lock_target(&self, run_id: Uuid) -> Result<Option<TargetLock>, LockError> {
        match &self.settings.lock {
            Some(lock) => TargetLock::acquire(
                &lock.dir,
                &self.settings.target,
                run_id,
                Duration::from_secs(lock.wait_secs),
            )
            .await
            .map(Some),
            None => Ok(None),
        }
    }
}

struct RunTracker {
    run_id: Uuid,
    states: Vec<RunState>,
}

impl RunTracker {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            states: vec![RunState::Idle],
        }
    }

    fn current(&self) -> RunState {
        self.states.last().copied().unwrap_or(RunState::Idle)
    }

    fn advance(&mut self, next: RunState) {
        let from = self.current();
        debug_assert!(from.can_advance_to(next), "illegal transition {from} -> {next}");
        info!(run_id = %self.run_id, %from, to = %next, "[RUN] State transition");
        self.states.push(next);
    }

    fn fail(&mut self, stage: Stage, err: impl Into<PipelineError>) -> PipelineError {
        let err = err.into();
        error!(run_id = %self.run_id, %stage, error = %err, "[RUN] Run failed");
        self.advance(RunState::Failed(stage));
        err
    }
}
