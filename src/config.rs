use crate::pool::PoolConfig;
use crate::supervisor::DevServerOptions;
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Host configuration loaded from TOML
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and connection pool settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Public path and default document
    #[serde(default)]
    pub spa: SpaConfig,

    /// Build-tool dev server to start and proxy to
    pub dev_server: Option<DevServerConfig>,

    /// Server-side prerendering of the default document
    pub prerender: Option<PrerenderConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP port (default: 5000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Directory static files are served from
    #[serde(default = "default_static_root")]
    pub static_root: PathBuf,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Limit on how long a request waits for a pending dev server port.
    /// Unbounded when unset.
    pub resolution_timeout_secs: Option<u64>,
}

impl ServerConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_host: self.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
        }
    }

    pub fn resolution_timeout(&self) -> Option<Duration> {
        self.resolution_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            static_root: default_static_root(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            resolution_timeout_secs: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SpaConfig {
    /// URL prefix the built assets live under (default: /dist)
    #[serde(default = "default_public_path")]
    pub public_path: String,

    /// Page the fallback rewrites to (default: index.html)
    #[serde(default = "default_page")]
    pub default_page: String,
}

impl Default for SpaConfig {
    fn default() -> Self {
        Self {
            public_path: default_public_path(),
            default_page: default_page(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DevServerConfig {
    /// Front-end project directory
    pub source_path: PathBuf,

    /// Build tool command line (default: npx ng)
    #[serde(default = "default_dev_server_command")]
    pub command: String,

    /// Extra flags after the `serve` arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables for the dev server
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Host the proxy connects to (default: localhost)
    #[serde(default = "default_dev_server_host")]
    pub host: String,

    /// Ready line pattern with a named `port` group
    pub ready_pattern: Option<String>,

    /// Proxied request timeout in seconds (default: 100)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Prefixes proxied without a timeout
    #[serde(default)]
    pub streaming_paths: Vec<String>,

    /// Seconds between SIGTERM and kill (default: 5)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl DevServerConfig {
    pub fn to_options(&self) -> DevServerOptions {
        let mut options = DevServerOptions::new(&self.source_path)
            .with_command(self.command.clone())
            .with_args(self.args.clone())
            .with_env(self.env.clone())
            .with_host(self.host.clone());
        if let Some(ref pattern) = self.ready_pattern {
            options = options.with_ready_pattern(pattern.clone());
        }
        options.request_timeout = Duration::from_secs(self.request_timeout_secs);
        options.streaming_paths = self.streaming_paths.clone();
        options.shutdown_grace_period = Duration::from_secs(self.shutdown_grace_period_secs);
        options
    }

    fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.source_path.as_os_str().is_empty() {
            errors.push("dev_server: 'source_path' cannot be empty".to_string());
        }
        if self.command.trim().is_empty() {
            errors.push("dev_server: 'command' cannot be empty".to_string());
        }
        if self.request_timeout_secs == 0 {
            errors.push("dev_server: 'request_timeout_secs' must be greater than 0".to_string());
        }
        for path in &self.streaming_paths {
            if !path.starts_with('/') {
                errors.push(format!("dev_server: streaming path '{}' must start with '/'", path));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PrerenderConfig {
    /// Server bundle handed to the renderer
    pub entry_point: String,

    /// Command run as `<renderer_command> <entry_point>`
    pub renderer_command: String,

    /// App the dev server builds on demand before the first render
    pub build_app: Option<String>,

    /// Per-render timeout in seconds
    pub render_timeout_secs: Option<u64>,
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    5000
}

fn default_static_root() -> PathBuf {
    PathBuf::from("wwwroot")
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections to the dev server
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_public_path() -> String {
    "/dist".to_string()
}

fn default_page() -> String {
    crate::fallback::DEFAULT_PAGE.to_string()
}

fn default_dev_server_command() -> String {
    "npx ng".to_string()
}

fn default_dev_server_host() -> String {
    "localhost".to_string()
}

fn default_request_timeout() -> u64 {
    100
}

fn default_shutdown_grace_period() -> u64 {
    5
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = crate::fallback::default_document_path(&self.spa.public_path, &self.spa.default_page) {
            errors.push(format!("spa: {}", e));
        }

        if let Some(ref dev_server) = self.dev_server {
            if let Err(mut e) = dev_server.validate() {
                errors.append(&mut e);
            }
        }

        if let Some(ref prerender) = self.prerender {
            if prerender.entry_point.trim().is_empty() {
                errors.push("prerender: 'entry_point' cannot be empty".to_string());
            }
            if prerender.renderer_command.trim().is_empty() {
                errors.push("prerender: 'renderer_command' cannot be empty".to_string());
            }
            if prerender.build_app.is_some() && self.dev_server.is_none() {
                errors.push("prerender: 'build_app' requires a [dev_server] section".to_string());
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "0.0.0.0"
static_root = "ClientApp/dist"
resolution_timeout_secs = 60

[spa]
public_path = "/app"

[dev_server]
source_path = "ClientApp"
command = "npx ng"
args = ["--configuration", "development"]
ready_pattern = 'serving on port (?P<port>\d+)'
streaming_paths = ["/app/sockjs-node"]

[dev_server.env]
NODE_OPTIONS = "--max-old-space-size=4096"

[prerender]
entry_point = "dist-server/main.js"
renderer_command = "node render.js"
build_app = "ssr"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.resolution_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.spa.public_path, "/app");
        assert_eq!(config.spa.default_page, "index.html");

        let dev_server = config.dev_server.unwrap();
        assert_eq!(dev_server.host, "localhost");
        let options = dev_server.to_options();
        assert_eq!(options.args, vec!["--configuration", "development"]);
        assert_eq!(options.env.get("NODE_OPTIONS").unwrap(), "--max-old-space-size=4096");
        assert_eq!(options.request_timeout, Duration::from_secs(100));
        assert_eq!(options.shutdown_grace_period, Duration::from_secs(5));
        assert_eq!(options.ready_pattern.as_deref(), Some(r"serving on port (?P<port>\d+)"));

        assert_eq!(config.prerender.unwrap().build_app.as_deref(), Some("ssr"));
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.static_root, PathBuf::from("wwwroot"));
        assert_eq!(config.server.resolution_timeout(), None);
        assert_eq!(config.spa.public_path, "/dist");
        assert!(config.dev_server.is_none());
        assert!(config.prerender.is_none());
    }

    #[test]
    fn test_pool_config_from_server() {
        let server = ServerConfig {
            pool_max_idle_per_host: 4,
            pool_idle_timeout_secs: 30,
            ..Default::default()
        };
        let pool = server.pool_config();
        assert_eq!(pool.max_idle_per_host, 4);
        assert_eq!(pool.idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_validate_public_path() {
        let config: Config = toml::from_str("[spa]\npublic_path = \"dist\"").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("must start with '/'"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[spa]
public_path = ""

[dev_server]
source_path = "ClientApp"
command = " "
streaming_paths = ["sockjs-node"]

[prerender]
entry_point = ""
renderer_command = "node render.js"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("public path cannot be empty"));
        assert!(err.contains("'command' cannot be empty"));
        assert!(err.contains("streaming path 'sockjs-node'"));
        assert!(err.contains("'entry_point' cannot be empty"));
    }

    #[test]
    fn test_build_app_requires_dev_server() {
        let toml = r#"
[prerender]
entry_point = "main.js"
renderer_command = "node render.js"
build_app = "ssr"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("requires a [dev_server] section"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spagate.toml");
        std::fs::write(&path, "[server]\nport = 5100\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 5100);

        let missing = Config::load(dir.path().join("missing.toml"));
        assert!(missing.unwrap_err().to_string().contains("Failed to read config file"));
    }
}
