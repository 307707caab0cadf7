// site-publish/src/config.rs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::acquire::SourceSettings;
use crate::contract::ThemeReference;
use crate::lock::LockSettings;
use crate::publish::PublishSettings;
use crate::render::RenderSettings;

/// Static pipeline configuration. Contains no secrets: the deploy key is read
/// from the environment variable named in `credential.env`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    #[serde(default)]
    pub trigger: TriggerSettings,
    pub source: SourceSettings,
    pub theme: ThemeSettings,
    #[serde(default)]
    pub render: RenderSettings,
    pub publish: PublishSettings,
    #[serde(default)]
    pub credential: CredentialSettings,
    #[serde(default)]
    pub ledger: Option<LedgerSettings>,
    #[serde(default)]
    pub lock: LockSettings,
}

impl SiteConfig {
    pub fn trace_loaded(&self) {
        info!(
            branches = ?self.trigger.branches,
            repo_url = %self.source.repo_url,
            theme = %self.theme.name,
            renderer = %self.render.program,
            target = %self.publish.target(),
            ledger = self.ledger.is_some(),
            "Loaded SiteConfig"
        );
        debug!(?self, "Config loaded (full debug)");
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSettings {
    /// Branch names or globs that start a run.
    #[serde(default = "default_branches")]
    pub branches: Vec<String>,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            branches: default_branches(),
        }
    }
}

fn default_branches() -> Vec<String> {
    vec!["main".to_string()]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemeSettings {
    pub name: String,
    /// Defaults to `themes/<name>` inside the source tree.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl ThemeSettings {
    pub fn reference(&self) -> ThemeReference {
        ThemeReference::new(&self.name, self.dir.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSettings {
    /// Environment variable holding the SSH deploy key.
    #[serde(default = "default_credential_env")]
    pub env: String,
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            env: default_credential_env(),
        }
    }
}

fn default_credential_env() -> String {
    "ACTIONS_DEPLOY_KEY".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSettings {
    pub dir: PathBuf,
    /// Newest builds to retain; older archives are pruned after each record.
    /// Unset keeps everything.
    #[serde(default)]
    pub keep: Option<usize>,
}
