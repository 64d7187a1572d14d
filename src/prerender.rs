//! On-demand prerendering of the default document
//!
//! The first fallback request starts the build; every request waits for that
//! same build and for the startup barrier before the renderer runs.

use crate::barrier::StartupBarrier;
use crate::body::{full, SpaResponse};
use crate::context::SpaContext;
use crate::error::SpaError;
use crate::render::Renderer;
use crate::signal::Signal;
use crate::supervisor::DevServerSupervisor;
use async_trait::async_trait;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST, LOCATION};
use hyper::{Request, Response, StatusCode};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Action that produces the server bundle before the first render
#[async_trait]
pub trait PrerenderBuild: Send + Sync {
    async fn build(&self) -> Result<(), SpaError>;
}

/// Builds `app` through the dev server registered for a source path
pub struct DevServerBuild {
    supervisor: Arc<DevServerSupervisor>,
    app: String,
}

impl DevServerBuild {
    pub fn new(supervisor: Arc<DevServerSupervisor>, app: impl Into<String>) -> Self {
        Self {
            supervisor,
            app: app.into(),
        }
    }

    /// Look up the supervisor the context holds for `source_path`
    pub fn from_context(context: &SpaContext, source_path: &Path, app: &str) -> Result<Self, SpaError> {
        let supervisor = context.dev_server(source_path).ok_or_else(|| {
            SpaError::Configuration(format!(
                "no dev server is registered for '{}'",
                source_path.display()
            ))
        })?;
        Ok(Self::new(supervisor, app))
    }

    pub fn app(&self) -> &str {
        &self.app
    }
}

#[async_trait]
impl PrerenderBuild for DevServerBuild {
    async fn build(&self) -> Result<(), SpaError> {
        self.supervisor.build_on_demand(&self.app).await
    }
}

pub struct OnDemandPrerenderer {
    entry_point: String,
    renderer: Arc<dyn Renderer>,
    build: Option<Arc<dyn PrerenderBuild>>,
    build_once: OnceLock<Signal<()>>,
    barrier: StartupBarrier,
    default_document: String,
}

impl OnDemandPrerenderer {
    pub fn new(
        entry_point: impl Into<String>,
        renderer: Arc<dyn Renderer>,
        build: Option<Arc<dyn PrerenderBuild>>,
        barrier: StartupBarrier,
        default_document: impl Into<String>,
    ) -> Result<Self, SpaError> {
        let entry_point = entry_point.into();
        if entry_point.trim().is_empty() {
            return Err(SpaError::Configuration("prerender entry point cannot be empty".to_string()));
        }
        Ok(Self {
            entry_point,
            renderer,
            build,
            build_once: OnceLock::new(),
            barrier,
            default_document: default_document.into(),
        })
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// The shared build outcome, started by whichever request gets here first.
    /// Runs as its own task so a disconnecting client cannot cancel it.
    fn build_signal(&self) -> Signal<()> {
        self.build_once
            .get_or_init(|| match self.build.clone() {
                Some(build) => {
                    info!(entry_point = %self.entry_point, "Starting on-demand build");
                    Signal::spawn(async move { build.build().await })
                }
                None => Signal::resolved(()),
            })
            .clone()
    }

    /// Render the default document for a fallback request
    pub async fn render<B>(&self, req: &Request<B>) -> Result<SpaResponse, SpaError> {
        self.build_signal().wait().await?;
        self.barrier.when_ready().await?;

        let template_url = absolute_url(req, &self.default_document);
        let custom_data = serde_json::json!({ "templateUrl": template_url });
        debug!(entry_point = %self.entry_point, template_url = %template_url, "Prerendering");

        let result = self
            .renderer
            .render_to_string(&self.entry_point, custom_data)
            .await?;

        if let Some(target) = result.redirect_target() {
            let location = HeaderValue::from_str(target)
                .map_err(|_| SpaError::Render(format!("invalid redirect URL '{}'", target)))?;
            debug!(location = %target, "Prerender redirect");
            return Response::builder()
                .status(StatusCode::FOUND)
                .header(LOCATION, location)
                .body(full(""))
                .map_err(|e| SpaError::Render(e.to_string()));
        }

        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/html; charset=utf-8")
            .body(full(result.html))
            .map_err(|e| SpaError::Render(e.to_string()))
    }
}

/// `scheme://host/path` as the browser sees it, honouring X-Forwarded-Proto
fn absolute_url<B>(req: &Request<B>, path: &str) -> String {
    let scheme = req
        .headers()
        .get(X_FORWARDED_PROTO)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| req.uri().scheme_str().map(str::to_string))
        .unwrap_or_else(|| "http".to_string());

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()));

    match host {
        Some(host) => format!("{}://{}{}", scheme, host, path),
        None => {
            warn!("Request has no Host header; template URL is relative");
            path.to_string()
        }
    }
}
