//! Renderer collaborator used for server-side prerendering

use crate::error::SpaError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Output of one render call. A non-empty redirect wins over the HTML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderResult {
    #[serde(default)]
    pub html: String,
    #[serde(default)]
    pub redirect_url: Option<String>,
}

impl RenderResult {
    pub fn html(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            redirect_url: None,
        }
    }

    pub fn redirect(url: impl Into<String>) -> Self {
        Self {
            html: String::new(),
            redirect_url: Some(url.into()),
        }
    }

    /// The redirect target, if one was returned
    pub fn redirect_target(&self) -> Option<&str> {
        self.redirect_url.as_deref().filter(|url| !url.is_empty())
    }
}

#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render the app at `entry_point` to HTML. `custom_data` carries at least
    /// `templateUrl`, the absolute URL of the default document.
    async fn render_to_string(
        &self,
        entry_point: &str,
        custom_data: serde_json::Value,
    ) -> Result<RenderResult, SpaError>;
}

/// Renders by running `<command> <entry point>` once per call.
///
/// The custom data is written to the child's stdin as JSON and a
/// [`RenderResult`] is read back from its stdout.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandRenderer {
    /// Build from a shell-style command line such as `node render.js`
    pub fn from_command_line(command: &str) -> Result<Self, SpaError> {
        let mut words = shell_words::split(command)
            .map_err(|e| SpaError::Configuration(format!("invalid renderer command '{}': {}", command, e)))?;
        if words.is_empty() {
            return Err(SpaError::Configuration("renderer command cannot be empty".to_string()));
        }
        let program = words.remove(0);
        Ok(Self {
            program,
            args: words,
            timeout: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn run(&self, entry_point: &str, input: Vec<u8>) -> Result<RenderResult, SpaError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(entry_point);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| SpaError::Render(format!("failed to start renderer '{}': {}", self.program, e)))?;

        // Output is drained while the input is written, so neither pipe can fill up
        let stdin = child.stdin.take();
        let write_input = async move {
            if let Some(mut stdin) = stdin {
                // A renderer that ignores its input may close stdin early
                if let Err(e) = stdin.write_all(&input).await {
                    debug!(error = %e, "Renderer did not read its input");
                }
            }
        };

        let ((), output) = tokio::join!(write_input, child.wait_with_output());
        let output = output.map_err(|e| SpaError::Render(format!("renderer did not complete: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(status = ?output.status, stderr = %stderr.trim(), "Renderer failed");
            return Err(SpaError::Render(format!(
                "renderer exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| SpaError::Render(format!("renderer produced invalid output: {}", e)))
    }
}

#[async_trait]
impl Renderer for CommandRenderer {
    async fn render_to_string(
        &self,
        entry_point: &str,
        custom_data: serde_json::Value,
    ) -> Result<RenderResult, SpaError> {
        let input = serde_json::to_vec(&custom_data)
            .map_err(|e| SpaError::Render(format!("could not encode custom data: {}", e)))?;
        debug!(program = %self.program, entry_point, "Invoking renderer");

        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.run(entry_point, input))
                .await
                .map_err(|_| SpaError::Render(format!("renderer timed out after {}s", timeout.as_secs())))?,
            None => self.run(entry_point, input).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_result_json() {
        let result: RenderResult =
            serde_json::from_str(r#"{"html":"<app-root></app-root>","redirectUrl":null}"#).unwrap();
        assert_eq!(result, RenderResult::html("<app-root></app-root>"));
        assert_eq!(result.redirect_target(), None);

        let result: RenderResult = serde_json::from_str(r#"{"redirectUrl":"/login"}"#).unwrap();
        assert_eq!(result.redirect_target(), Some("/login"));

        let result: RenderResult = serde_json::from_str(r#"{"html":"x","redirectUrl":""}"#).unwrap();
        assert_eq!(result.redirect_target(), None);
    }

    #[test]
    fn test_from_command_line() {
        assert!(CommandRenderer::from_command_line("node render.js").is_ok());
        assert!(matches!(
            CommandRenderer::from_command_line(""),
            Err(SpaError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_command_renderer_passes_entry_point_and_data() {
        // The entry point arrives as $0; the custom data on stdin is echoed back
        let script = r#"data=$(cat); printf '{"html":"<p>%s</p><!-- %s -->"}' "$0" "$(echo "$data" | tr -d '"{}')""#;
        let renderer = CommandRenderer::from_command_line(&format!("sh -c {}", shell_words::quote(script))).unwrap();

        let result = renderer
            .render_to_string("main.bundle.js", json!({"templateUrl": "http://localhost:5000/dist/index.html"}))
            .await
            .unwrap();

        assert!(result.html.starts_with("<p>main.bundle.js</p>"));
        assert!(result.html.contains("templateUrl:http://localhost:5000/dist/index.html"));
    }

    #[tokio::test]
    async fn test_large_output_before_reading_input() {
        // Fills the stdout pipe before consuming stdin
        let script = r#"printf '{"html":"'; head -c 200000 /dev/zero | tr '\0' x; cat >/dev/null; printf '"}'"#;
        let renderer = CommandRenderer::from_command_line(&format!("sh -c {}", shell_words::quote(script)))
            .unwrap()
            .with_timeout(Duration::from_secs(10));
        let payload = "y".repeat(200_000);

        let result = renderer
            .render_to_string("main.js", json!({ "templateUrl": "http://localhost:5000/dist/index.html", "payload": payload }))
            .await
            .unwrap();

        assert_eq!(result.html.len(), 200_000);
        assert!(result.html.bytes().all(|b| b == b'x'));
    }

    #[tokio::test]
    async fn test_command_renderer_failure_is_render_error() {
        let renderer = CommandRenderer::from_command_line("sh -c 'echo boom >&2; exit 2'").unwrap();

        let result = renderer.render_to_string("main.js", json!({})).await;

        match result {
            Err(SpaError::Render(message)) => assert!(message.contains("boom")),
            other => panic!("expected render error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_command_renderer_invalid_output() {
        let renderer = CommandRenderer::from_command_line("sh -c 'echo not-json'").unwrap();

        let result = renderer.render_to_string("main.js", json!({})).await;

        assert!(matches!(result, Err(SpaError::Render(_))));
    }
}
