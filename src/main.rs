use spagate::config::Config;
use spagate::prerender::{DevServerBuild, PrerenderBuild};
use spagate::render::{CommandRenderer, Renderer};
use spagate::server::SpaServer;
use spagate::static_files::ServeDir;
use spagate::{SpaApp, SpaContext};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("spagate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("spagate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let app = Arc::new(build_app(&config)?);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = SpaServer::new(bind_addr, Arc::clone(&app), shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "SPA server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    info!("Stopping dev servers...");
    app.shutdown().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn build_app(config: &Config) -> anyhow::Result<SpaApp> {
    let mut context = SpaContext::new(&config.spa.public_path)?
        .with_default_page(&config.spa.default_page)?
        .with_pool_config(config.server.pool_config())
        .with_resolution_timeout(config.server.resolution_timeout());

    if let Some(ref dev_server) = config.dev_server {
        context.use_dev_server(dev_server.to_options())?;
    }

    if let Some(ref prerender) = config.prerender {
        let mut renderer = CommandRenderer::from_command_line(&prerender.renderer_command)?;
        if let Some(secs) = prerender.render_timeout_secs {
            renderer = renderer.with_timeout(Duration::from_secs(secs));
        }
        let renderer: Arc<dyn Renderer> = Arc::new(renderer);

        let build: Option<Arc<dyn PrerenderBuild>> = match (&prerender.build_app, &config.dev_server) {
            (Some(app), Some(dev_server)) => Some(Arc::new(DevServerBuild::from_context(
                &context,
                &dev_server.source_path,
                app,
            )?)),
            _ => None,
        };

        context.use_prerendering(&prerender.entry_point, renderer, build)?;
    }

    Ok(context.into_app(Arc::new(ServeDir::new(&config.server.static_root))))
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting SPA host");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        static_root = %config.server.static_root.display(),
        resolution_timeout_secs = config.server.resolution_timeout_secs,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        public_path = %config.spa.public_path,
        default_page = %config.spa.default_page,
        "SPA settings"
    );
    if let Some(ref dev_server) = config.dev_server {
        info!(
            source_path = %dev_server.source_path.display(),
            command = %dev_server.command,
            request_timeout_secs = dev_server.request_timeout_secs,
            streaming_paths = ?dev_server.streaming_paths,
            "Dev server settings"
        );
    }
    if let Some(ref prerender) = config.prerender {
        info!(
            entry_point = %prerender.entry_point,
            renderer = %prerender.renderer_command,
            build_app = ?prerender.build_app,
            "Prerender settings"
        );
    }
}
