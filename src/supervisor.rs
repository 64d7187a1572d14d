//! Build-tool dev server supervision
//!
//! The dev server is spawned as
//! `<command> serve --port <N> --deploy-url <prefix> [args]` and is considered
//! ready once it prints a line accepted by the [`ReadyLineMatcher`]. The port
//! in that line wins over the one requested, since tools may pick another one.
//!
//! On-demand builds are requested over the child's stdin with `build <app>`;
//! the tool answers on stdout with `build <app> succeeded` or
//! `build <app> failed[: reason]`.

use crate::error::SpaError;
use crate::port::{acquire_free_port, scan_for_ready_port, ReadyLineMatcher};
use crate::signal::{self, Resolver, Signal};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

const LOG_TARGET: &str = "spagate::devserver";

const BUILD_RESULT_PATTERN: &str =
    r"^build (?P<app>\S+) (?P<status>succeeded|failed)(?::\s*(?P<reason>.*))?$";

/// How to launch the dev server
#[derive(Debug, Clone)]
pub struct DevServerOptions {
    /// Directory containing the front-end project; becomes the working directory
    pub source_path: PathBuf,
    /// Build tool command line, split shell-style (`npx ng`)
    pub command: String,
    /// Extra flags appended after the `serve` arguments
    pub args: Vec<String>,
    /// Environment variables overlaid on the inherited environment
    pub env: HashMap<String, String>,
    /// Host the proxy connects to once the port is known
    pub host: String,
    /// Custom ready line pattern with a named `port` group
    pub ready_pattern: Option<String>,
    /// Round-trip limit for proxied asset requests
    pub request_timeout: Duration,
    /// Extra prefixes proxied without a timeout (event streams)
    pub streaming_paths: Vec<String>,
    /// Time between SIGTERM and kill on shutdown
    pub shutdown_grace_period: Duration,
}

impl DevServerOptions {
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            command: "npx ng".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            host: "localhost".to_string(),
            ready_pattern: None,
            request_timeout: crate::proxy::DEFAULT_REQUEST_TIMEOUT,
            streaming_paths: Vec::new(),
            shutdown_grace_period: Duration::from_secs(5),
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_ready_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.ready_pattern = Some(pattern.into());
        self
    }
}

/// What the dev server reported once it was ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendReadyInfo {
    pub port: u16,
    pub public_paths: Vec<String>,
}

#[derive(Debug, Clone)]
enum SupervisorEvent {
    BuildFinished { app: String, outcome: Result<(), String> },
    Exited,
}

/// Owns one running dev server process
pub struct DevServerSupervisor {
    source_path: PathBuf,
    options: DevServerOptions,
    deploy_url: String,
    requested_port: Option<u16>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    ready: Signal<BackendReadyInfo>,
    port: Signal<u16>,
    events: broadcast::Sender<SupervisorEvent>,
    exited: Arc<AtomicBool>,
}

impl DevServerSupervisor {
    /// Spawn the dev server.
    ///
    /// Invalid options fail synchronously. A failed spawn is reported through
    /// [`ready`](Self::ready) instead, so callers wire routes the same way in
    /// both cases.
    pub fn start(options: DevServerOptions, deploy_url: &str) -> Result<Arc<Self>, SpaError> {
        let source_path = validate_source_path(&options.source_path)?;
        let (program, base_args) = parse_command(&options.command)?;
        let matcher = match options.ready_pattern.as_deref() {
            Some(pattern) => ReadyLineMatcher::new(pattern)?,
            None => ReadyLineMatcher::default(),
        };

        let (events, _) = broadcast::channel(64);
        let exited = Arc::new(AtomicBool::new(false));
        let (resolver, ready) = signal::channel();

        let (requested_port, child_handle, stdin_handle) = match acquire_free_port() {
            Err(e) => {
                error!(error = %e, "Could not acquire a port for the dev server");
                exited.store(true, Ordering::SeqCst);
                resolver.fail(SpaError::Startup(format!("no free port available: {}", e)));
                (None, None, None)
            }
            Ok(port) => {
                info!(
                    source_path = %source_path.display(),
                    command = %options.command,
                    port,
                    deploy_url,
                    "Starting dev server"
                );

                let mut cmd = Command::new(&program);
                cmd.args(&base_args);
                cmd.arg("serve")
                    .arg("--port")
                    .arg(port.to_string())
                    .arg("--deploy-url")
                    .arg(deploy_url);
                cmd.args(&options.args);
                cmd.current_dir(&source_path);
                cmd.envs(&options.env);
                cmd.stdin(Stdio::piped());
                cmd.stdout(Stdio::piped());
                cmd.stderr(Stdio::piped());
                cmd.kill_on_drop(true);

                match cmd.spawn() {
                    Ok(mut child) => {
                        info!(pid = child.id().unwrap_or(0), "Dev server process spawned");
                        let stdin = child.stdin.take();
                        if let Some(stderr) = child.stderr.take() {
                            tokio::spawn(drain_stderr(stderr));
                        }
                        match child.stdout.take() {
                            Some(stdout) => {
                                tokio::spawn(drain_stdout(
                                    stdout,
                                    matcher,
                                    resolver,
                                    vec![deploy_url.to_string()],
                                    events.clone(),
                                    Arc::clone(&exited),
                                ));
                            }
                            None => resolver.fail(SpaError::Startup(
                                "dev server stdout was not captured".to_string(),
                            )),
                        }
                        (Some(port), Some(child), stdin)
                    }
                    Err(e) => {
                        error!(command = %options.command, error = %e, "Failed to spawn dev server");
                        exited.store(true, Ordering::SeqCst);
                        resolver.fail(SpaError::Startup(format!(
                            "failed to start '{}': {}",
                            options.command, e
                        )));
                        (Some(port), None, None)
                    }
                }
            }
        };

        // Derived once so every caller shares the same resolution state
        let port = ready.map(|info| info.port);

        Ok(Arc::new(Self {
            source_path,
            options,
            deploy_url: deploy_url.to_string(),
            requested_port,
            child: Mutex::new(child_handle),
            stdin: Mutex::new(stdin_handle),
            ready,
            port,
            events,
            exited,
        }))
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn options(&self) -> &DevServerOptions {
        &self.options
    }

    pub fn deploy_url(&self) -> &str {
        &self.deploy_url
    }

    /// Port passed on the command line; the reported port may differ
    pub fn requested_port(&self) -> Option<u16> {
        self.requested_port
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Resolves once the dev server has reported its port
    pub fn ready(&self) -> Signal<BackendReadyInfo> {
        self.ready.clone()
    }

    pub fn port(&self) -> Signal<u16> {
        self.port.clone()
    }

    /// Wait for readiness with a caller-imposed deadline
    pub async fn wait_ready(&self, timeout: Duration) -> Result<BackendReadyInfo, SpaError> {
        self.ready.wait_timeout(timeout, "dev server to report its port").await
    }

    /// Ask the running tool to build `app` and wait for its answer
    pub async fn build_on_demand(&self, app: &str) -> Result<(), SpaError> {
        if app.is_empty() || app.chars().any(char::is_whitespace) {
            return Err(SpaError::Configuration(format!("invalid app identifier '{}'", app)));
        }

        self.ready.wait().await?;

        // Subscribe before sending so the answer cannot slip past
        let mut events = self.events.subscribe();
        if self.has_exited() {
            return Err(SpaError::Startup("dev server is not running".to_string()));
        }

        {
            let mut stdin = self.stdin.lock().await;
            let stdin = stdin
                .as_mut()
                .ok_or_else(|| SpaError::Startup("dev server stdin is closed".to_string()))?;
            let command = format!("build {}\n", app);
            stdin
                .write_all(command.as_bytes())
                .await
                .map_err(|e| SpaError::Startup(format!("failed to send build command: {}", e)))?;
            stdin
                .flush()
                .await
                .map_err(|e| SpaError::Startup(format!("failed to send build command: {}", e)))?;
        }
        info!(app, "On-demand build requested");

        loop {
            match events.recv().await {
                Ok(SupervisorEvent::BuildFinished { app: finished, outcome }) if finished == app => {
                    return match outcome {
                        Ok(()) => {
                            info!(app, "On-demand build succeeded");
                            Ok(())
                        }
                        Err(reason) => {
                            error!(app, reason = %reason, "On-demand build failed");
                            Err(SpaError::Render(format!("build of '{}' failed: {}", app, reason)))
                        }
                    };
                }
                Ok(SupervisorEvent::BuildFinished { .. }) => {}
                Ok(SupervisorEvent::Exited) | Err(broadcast::error::RecvError::Closed) => {
                    return Err(SpaError::Startup(format!(
                        "dev server exited while building '{}'",
                        app
                    )));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(app, skipped, "Missed dev server events while waiting for build");
                }
            }
        }
    }

    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(|child| child.id())
    }

    /// Stop the dev server: close stdin, SIGTERM, then kill after the grace period
    pub async fn shutdown(&self) {
        self.stdin.lock().await.take();

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        let grace_period = self.options.shutdown_grace_period;

        if let Some(pid) = child.id() {
            info!(pid, "Sending SIGTERM to dev server");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                info!(?status, "Dev server exited");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Error waiting for dev server to exit");
            }
            Err(_) => {
                warn!(
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, killing dev server"
                );
                let _ = child.kill().await;
            }
        }
    }
}

fn validate_source_path(path: &Path) -> Result<PathBuf, SpaError> {
    if path.as_os_str().is_empty() {
        return Err(SpaError::Configuration("source path cannot be empty".to_string()));
    }
    if !path.is_dir() {
        return Err(SpaError::Configuration(format!(
            "source path '{}' is not a directory",
            path.display()
        )));
    }
    Ok(path.to_path_buf())
}

fn parse_command(command: &str) -> Result<(String, Vec<String>), SpaError> {
    let mut words = shell_words::split(command)
        .map_err(|e| SpaError::Configuration(format!("invalid dev server command '{}': {}", command, e)))?;
    if words.is_empty() {
        return Err(SpaError::Configuration("dev server command cannot be empty".to_string()));
    }
    let program = words.remove(0);
    Ok((program, words))
}

fn build_result_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(BUILD_RESULT_PATTERN).expect("build result pattern compiles"))
}

fn parse_build_result(line: &str) -> Option<(String, Result<(), String>)> {
    let captures = build_result_pattern().captures(line.trim())?;
    let app = captures.name("app")?.as_str().to_string();
    let outcome = match captures.name("status")?.as_str() {
        "succeeded" => Ok(()),
        _ => Err(captures
            .name("reason")
            .map(|r| r.as_str().trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "no reason given".to_string())),
    };
    Some((app, outcome))
}

/// Read stdout until EOF so the child never blocks on a full pipe
async fn drain_stdout<R>(
    stdout: R,
    matcher: ReadyLineMatcher,
    resolver: Resolver<BackendReadyInfo>,
    public_paths: Vec<String>,
    events: broadcast::Sender<SupervisorEvent>,
    exited: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stdout).lines();
    let on_line = |line: &str| {
        debug!(target: LOG_TARGET, "{}", line);
        if let Some((app, outcome)) = parse_build_result(line) {
            let _ = events.send(SupervisorEvent::BuildFinished { app, outcome });
        }
    };

    match scan_for_ready_port(&mut lines, &matcher, &on_line).await {
        Some(port) => {
            info!(port, "Dev server is ready");
            resolver.resolve(BackendReadyInfo { port, public_paths });
        }
        None => {
            error!("Dev server exited before reporting its port");
            exited.store(true, Ordering::SeqCst);
            let _ = events.send(SupervisorEvent::Exited);
            resolver.fail(SpaError::Startup(
                "dev server exited before reporting its port".to_string(),
            ));
            return;
        }
    }

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => on_line(&line),
            Ok(None) => break,
            Err(e) => {
                warn!(target: LOG_TARGET, error = %e, "Failed to read dev server output");
                break;
            }
        }
    }

    exited.store(true, Ordering::SeqCst);
    let _ = events.send(SupervisorEvent::Exited);
    warn!("Dev server output closed");
}

async fn drain_stderr<R>(stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(target: LOG_TARGET, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script_options(dir: &Path, script: &str) -> DevServerOptions {
        let command = format!("sh -c {}", shell_words::quote(script));
        let mut options = DevServerOptions::new(dir).with_command(command);
        options.shutdown_grace_period = Duration::from_secs(1);
        options
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(
            parse_command("npx ng").unwrap(),
            ("npx".to_string(), vec!["ng".to_string()])
        );
        assert_eq!(
            parse_command("sh -c 'echo hi'").unwrap(),
            ("sh".to_string(), vec!["-c".to_string(), "echo hi".to_string()])
        );
        assert!(matches!(parse_command("   "), Err(SpaError::Configuration(_))));
        assert!(matches!(parse_command("sh -c 'oops"), Err(SpaError::Configuration(_))));
    }

    #[test]
    fn test_parse_build_result() {
        assert_eq!(
            parse_build_result("build ssr succeeded"),
            Some(("ssr".to_string(), Ok(())))
        );
        assert_eq!(
            parse_build_result("build ssr failed: main.ts(3,1): error TS1005"),
            Some(("ssr".to_string(), Err("main.ts(3,1): error TS1005".to_string())))
        );
        assert_eq!(
            parse_build_result("build ssr failed"),
            Some(("ssr".to_string(), Err("no reason given".to_string())))
        );
        assert_eq!(parse_build_result("webpack: Compiled successfully."), None);
    }

    #[test]
    fn test_start_rejects_missing_source_path() {
        let options = DevServerOptions::new("/definitely/not/here");
        assert!(matches!(
            DevServerSupervisor::start(options, "/dist"),
            Err(SpaError::Configuration(_))
        ));

        let options = DevServerOptions::new("");
        assert!(matches!(
            DevServerSupervisor::start(options, "/dist"),
            Err(SpaError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_reported_port_resolves_ready() {
        let dir = tempfile::tempdir().unwrap();
        // $2 is the port passed after `serve --port`
        let options = script_options(
            dir.path(),
            r#"echo "compiling"; echo "listening on http://localhost:$2/"; exec sleep 30"#,
        );

        let supervisor = DevServerSupervisor::start(options, "/dist").unwrap();
        let info = supervisor.wait_ready(Duration::from_secs(5)).await.unwrap();

        assert_eq!(Some(info.port), supervisor.requested_port());
        assert_eq!(info.public_paths, vec!["/dist".to_string()]);
        assert_eq!(supervisor.deploy_url(), "/dist");
        assert_eq!(supervisor.port().wait().await, Ok(info.port));
        // Every handle shares the resolution once any of them has awaited it
        assert_eq!(supervisor.port().peek(), Some(Ok(info.port)));
        assert!(supervisor.pid().await.is_some());

        supervisor.shutdown().await;
        assert!(supervisor.pid().await.is_none());
    }

    #[tokio::test]
    async fn test_custom_ready_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let options = script_options(
            dir.path(),
            r#"echo "listening on http://localhost:1111/"; echo "PORT=$2"; exec sleep 30"#,
        )
        .with_ready_pattern(r"^PORT=(?P<port>\d+)$");

        let supervisor = DevServerSupervisor::start(options, "/dist").unwrap();
        let info = supervisor.wait_ready(Duration::from_secs(5)).await.unwrap();

        assert_eq!(Some(info.port), supervisor.requested_port());
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_fails_ready() {
        let dir = tempfile::tempdir().unwrap();
        let options = DevServerOptions::new(dir.path()).with_command("spagate-no-such-build-tool");

        let supervisor = DevServerSupervisor::start(options, "/dist").unwrap();

        assert!(matches!(supervisor.ready().wait().await, Err(SpaError::Startup(_))));
        assert!(supervisor.has_exited());
    }

    #[tokio::test]
    async fn test_exit_before_ready_fails_ready() {
        let dir = tempfile::tempdir().unwrap();
        let options = script_options(dir.path(), "echo 'error: project not found' >&2; exit 3");

        let supervisor = DevServerSupervisor::start(options, "/dist").unwrap();
        let result = supervisor.wait_ready(Duration::from_secs(5)).await;

        assert!(matches!(result, Err(SpaError::Startup(_))));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let options = script_options(dir.path(), "exec sleep 30");

        let supervisor = DevServerSupervisor::start(options, "/dist").unwrap();
        let result = supervisor.wait_ready(Duration::from_millis(300)).await;

        assert!(matches!(result, Err(SpaError::ResolutionTimeout { .. })));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_environment_overlay_reaches_child() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert("SPA_TEST_PORT".to_string(), "43210".to_string());
        let options = script_options(
            dir.path(),
            r#"echo "listening on http://localhost:$SPA_TEST_PORT/"; exec sleep 30"#,
        )
        .with_env(env);

        let supervisor = DevServerSupervisor::start(options, "/dist").unwrap();
        let info = supervisor.wait_ready(Duration::from_secs(5)).await.unwrap();

        assert_eq!(info.port, 43210);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_build_on_demand_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let options = script_options(
            dir.path(),
            r#"echo "listening on http://localhost:$2/"
while read -r cmd app; do
  if [ "$app" = "broken" ]; then echo "build $app failed: syntax error"; else echo "build $app succeeded"; fi
done"#,
        );

        let supervisor = DevServerSupervisor::start(options, "/dist").unwrap();

        supervisor.build_on_demand("ssr").await.unwrap();
        assert_eq!(
            supervisor.build_on_demand("broken").await,
            Err(SpaError::Render("build of 'broken' failed: syntax error".to_string()))
        );
        assert!(matches!(
            supervisor.build_on_demand("two words").await,
            Err(SpaError::Configuration(_))
        ));

        supervisor.shutdown().await;
    }
}
