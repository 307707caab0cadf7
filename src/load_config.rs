use crate::build_output::resolve_output_dir;
use crate::config::SiteConfig;
use crate::contract::DeployCredential;
use anyhow::Result;
use std::fs;
use std::path::Path;
use tracing::{error, info, warn};

/// A parsed config plus the secret injected from the environment.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub site: SiteConfig,
    /// `None` when the variable is unset or blank; runs then fail with a
    /// missing-credential error before any step starts.
    pub credential: Option<DeployCredential>,
}

/// Loads a static YAML config file (no secrets) and reads the deploy key from
/// the environment variable it names.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<LoadedConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => {
            info!(config_path = ?path_ref, "Config file read successfully");
            content
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!("Failed to read config file {:?}: {}", path_ref, e));
        }
    };

    let site: SiteConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    validate(&site)?;

    let credential = match std::env::var(&site.credential.env) {
        Ok(key) if !key.trim().is_empty() => {
            info!(var = %site.credential.env, "Deploy key found in env");
            Some(DeployCredential::new(key))
        }
        Ok(_) => {
            warn!(var = %site.credential.env, "Deploy key environment variable is empty");
            None
        }
        Err(e) => {
            warn!(error = ?e, var = %site.credential.env, "Deploy key environment variable not set");
            None
        }
    };

    site.trace_loaded();
    Ok(LoadedConfig { site, credential })
}

fn validate(site: &SiteConfig) -> Result<()> {
    let required = [
        ("source.repo_url", site.source.repo_url.as_str()),
        ("theme.name", site.theme.name.as_str()),
        ("render.program", site.render.program.as_str()),
        ("publish.external_repository", site.publish.external_repository.as_str()),
        ("publish.publish_branch", site.publish.publish_branch.as_str()),
        ("credential.env", site.credential.env.as_str()),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            error!(field, "Required config field is empty");
            anyhow::bail!("Config field `{field}` must not be empty");
        }
    }
    let source_root = std::env::current_dir()?.join(&site.source.workdir);
    if let Err(e) = resolve_output_dir(&site.render.output_dir, &source_root) {
        error!(error = %e, "render.output_dir is unsafe");
        anyhow::bail!("Config field `render.output_dir` is invalid: {e}");
    }
    if site.ledger.as_ref().and_then(|l| l.keep) == Some(0) {
        error!("ledger.keep is 0");
        anyhow::bail!("Config field `ledger.keep` must be at least 1 when set");
    }
    if site.trigger.branches.is_empty() {
        error!("trigger.branches is empty");
        anyhow::bail!("Config field `trigger.branches` must list at least one branch");
    }
    Ok(())
}
