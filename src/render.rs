//! Invokes the external static-site generator as a black box.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::contract::{RenderError, RenderReport, Renderer, SourceSnapshot, ThemeReference};
use crate::exec;

/// Generator command line. Arguments may contain `{theme}`, `{theme_dir}`,
/// `{output_dir}` and `{source}`, substituted per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderSettings {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Relative to the source root unless absolute.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// 0 disables the timeout.
    #[serde(default)]
    pub timeout_secs: u64,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            output_dir: default_output_dir(),
            timeout_secs: 0,
        }
    }
}

fn default_program() -> String {
    "hugo".to_string()
}

fn default_args() -> Vec<String> {
    ["--theme", "{theme}", "--destination", "{output_dir}"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("public")
}

/// Runs the configured generator command in the source root.
pub struct CommandRenderer {
    settings: RenderSettings,
}

impl CommandRenderer {
    pub fn new(settings: RenderSettings) -> Self {
        Self { settings }
    }

    fn expand_args(
        &self,
        source: &SourceSnapshot,
        theme: &ThemeReference,
        output_dir: &Path,
    ) -> Vec<String> {
        let theme_dir = source.root.join(&theme.dir);
        self.settings
            .args
            .iter()
            .map(|arg| {
                arg.replace("{theme_dir}", &theme_dir.to_string_lossy())
                    .replace("{theme}", &theme.name)
                    .replace("{output_dir}", &output_dir.to_string_lossy())
                    .replace("{source}", &source.root.to_string_lossy())
            })
            .collect()
    }
}

#[async_trait]
impl Renderer for CommandRenderer {
    async fn render(
        &self,
        source: &SourceSnapshot,
        theme: &ThemeReference,
        output_dir: &Path,
    ) -> Result<RenderReport, RenderError> {
        let args = self.expand_args(source, theme, output_dir);
        let timeout =
            (self.settings.timeout_secs > 0).then(|| Duration::from_secs(self.settings.timeout_secs));
        info!(
            program = %self.settings.program,
            theme = %theme.name,
            output_dir = %output_dir.display(),
            "Invoking renderer"
        );

        let output = exec::run(&self.settings.program, &args, &source.root, &[], timeout).await?;
        debug!(stdout = %output.stdout, "Renderer stdout");

        if !output.success() {
            error!(
                program = %self.settings.program,
                code = ?output.code,
                stderr = %output.stderr,
                "Renderer exited with non-zero code"
            );
            return Err(RenderError::Exited {
                code: output.code,
                stderr: output.stderr_tail(),
            });
        }

        info!(duration_ms = output.duration_ms, "Renderer finished");
        Ok(RenderReport {
            stdout: output.stdout,
            stderr: output.stderr,
            duration_ms: output.duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::HistoryDepth;

    fn snapshot(root: &Path) -> SourceSnapshot {
        SourceSnapshot {
            root: root.to_path_buf(),
            branch: "main".into(),
            commit: "abc".into(),
            history: HistoryDepth::Full,
        }
    }

    fn shell(script: &str) -> RenderSettings {
        RenderSettings {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            ..RenderSettings::default()
        }
    }

    #[test]
    fn default_settings_invoke_hugo_into_public() {
        let settings = RenderSettings::default();
        assert_eq!(settings.program, "hugo");
        assert_eq!(settings.output_dir, PathBuf::from("public"));
        assert_eq!(settings.timeout_secs, 0);
    }

    #[test]
    fn placeholders_are_substituted() {
        let renderer = CommandRenderer::new(RenderSettings::default());
        let theme = ThemeReference::new("paper", None);
        let args = renderer.expand_args(&snapshot(Path::new("/src")), &theme, Path::new("/src/public"));
        assert_eq!(args, vec!["--theme", "paper", "--destination", "/src/public"]);

        let renderer = CommandRenderer::new(shell("ls {theme_dir} {source}"));
        let args = renderer.expand_args(&snapshot(Path::new("/src")), &theme, Path::new("/out"));
        assert_eq!(args[1], "ls /src/themes/paper /src");
    }

    #[tokio::test]
    async fn successful_render_writes_output() {
        let tmp = tempfile::tempdir().unwrap();
        let renderer = CommandRenderer::new(shell("mkdir -p {output_dir} && echo '<h1>{theme}</h1>' > {output_dir}/index.html"));
        let theme = ThemeReference::new("paper", None);
        let out = tmp.path().join("public");

        renderer
            .render(&snapshot(tmp.path()), &theme, &out)
            .await
            .expect("render should succeed");
        let html = std::fs::read_to_string(out.join("index.html")).unwrap();
        assert!(html.contains("paper"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_render_failure_with_code() {
        let tmp = tempfile::tempdir().unwrap();
        let renderer = CommandRenderer::new(shell("echo 'bad front matter' >&2; exit 2"));
        let theme = ThemeReference::new("paper", None);

        let err = renderer
            .render(&snapshot(tmp.path()), &theme, &tmp.path().join("public"))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(2));
        assert!(err.to_string().contains("bad front matter"));
    }

    #[tokio::test]
    async fn timeout_is_a_render_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = shell("sleep 5");
        settings.timeout_secs = 1;
        let renderer = CommandRenderer::new(settings);
        let theme = ThemeReference::new("paper", None);

        let err = renderer
            .render(&snapshot(tmp.path()), &theme, &tmp.path().join("public"))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Exec(exec::ExecError::TimedOut { .. })));
    }
}
