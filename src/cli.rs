use clap::{Parser, Subcommand};
use std::path::PathBuf;
use anyhow::{Context, Result};
use crate::load_config::load_config;
use crate::pipeline::{Pipeline, RunOutcome};
use crate::trigger::TriggerEvent;

/// CLI for site-publish: render a content repository and publish the site.
#[derive(Parser)]
#[clap(
    name = "site-publish",
    version,
    about = "Build a static site from a content repository and publish it to a hosting repository"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Handle one push: acquire, clean, render and publish
    Run {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Pushed branch (`refs/heads/` prefix is accepted)
        #[clap(long, env = "GITHUB_REF_NAME")]
        branch: Option<String>,
        /// Pushed commit
        #[clap(long, env = "GITHUB_SHA", default_value = "HEAD")]
        commit: String,
        /// Push webhook payload (JSON); overrides --branch/--commit
        #[clap(long)]
        event: Option<PathBuf>,
    },
    /// List archived builds, newest first
    Builds {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Delete all but the newest N archived builds first
        #[clap(long, value_name = "N")]
        prune: Option<usize>,
    },
    /// Publish an archived build again without re-rendering
    Republish {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Build id (full SHA-256 hex)
        #[clap(long)]
        build: String,
    },
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");

    let result = dispatch(cli.command).await;

    let exit_span = tracing::info_span!("exit");
    exit_span.in_scope(|| {
        tracing::info!(ok = result.is_ok(), "exit");
    });

    // Explicit process exit only in main(), not in run()
    result
}

async fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            config,
            branch,
            commit,
            event,
        } => {
            let Some(trigger) = read_trigger(branch, commit, event)? else {
                println!("Push is not a branch update, nothing to do.");
                return Ok(());
            };
            let loaded = load_config(config)?;
            let pipeline = Pipeline::from_config(&loaded.site, loaded.credential)?;
            println!("Pipeline starting for {}@{}...", trigger.branch, trigger.commit);
            match pipeline.run(trigger).await {
                Ok(RunOutcome::Skipped { branch }) => {
                    println!("Branch {branch} is not configured for publishing, skipped.");
                    Ok(())
                }
                Ok(RunOutcome::Completed(report)) => {
                    println!("Pipeline complete.\nReport:");
                    println!("{:#?}", report);
                    Ok(())
                }
                Err(e) => {
                    eprintln!("[ERROR] Pipeline failed at {}: {}", e.stage(), e);
                    Err(e.into())
                }
            }
        }
        Commands::Builds { config, prune } => {
            let loaded = load_config(config)?;
            let pipeline = Pipeline::from_config(&loaded.site, loaded.credential)?;
            let Some(ledger) = pipeline.ledger() else {
                anyhow::bail!("No build ledger is configured (set `ledger.dir`)");
            };
            if let Some(keep) = prune {
                let removed = ledger.prune(keep)?;
                println!("Pruned {} archived build(s)", removed.len());
            }
            let manifests = ledger.list()?;
            if manifests.is_empty() {
                println!("No archived builds in {}", ledger.dir().display());
            }
            for m in manifests {
                println!(
                    "{}  {}  {}@{}  {} files",
                    m.build_id,
                    m.created_at.to_rfc3339(),
                    m.branch,
                    m.source_commit,
                    m.files.len()
                );
            }
            Ok(())
        }
        Commands::Republish { config, build } => {
            let loaded = load_config(config)?;
            let pipeline = Pipeline::from_config(&loaded.site, loaded.credential)?;
            match pipeline.republish(&build).await {
                Ok(receipt) => {
                    println!("Republished {} to {} ({})", receipt.build_id, receipt.target, receipt.commit);
                    Ok(())
                }
                Err(e) => {
                    eprintln!("[ERROR] Republish failed: {}", e);
                    Err(e.into())
                }
            }
        }
    }
}

/// `Ok(None)` when the payload describes a tag push or branch deletion.
fn read_trigger(
    branch: Option<String>,
    commit: String,
    event: Option<PathBuf>,
) -> Result<Option<TriggerEvent>> {
    if let Some(path) = event {
        let payload = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read push event {:?}", path))?;
        return Ok(TriggerEvent::from_push_payload(&payload)?);
    }
    let branch = branch.context("No branch given: pass --branch, --event, or set GITHUB_REF_NAME")?;
    Ok(Some(TriggerEvent::new(branch, commit)))
}
