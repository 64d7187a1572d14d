//! Application wiring: configuration-time [`SpaContext`] and the immutable
//! [`SpaApp`] that serves requests.

use crate::barrier::StartupBarrier;
use crate::body::{SpaRequest, SpaResponse};
use crate::error::SpaError;
use crate::fallback::{is_fallback, FallbackRouter, DEFAULT_PAGE};
use crate::pool::PoolConfig;
use crate::prerender::{OnDemandPrerenderer, PrerenderBuild};
use crate::proxy::{BackendRoute, ConditionalProxy};
use crate::render::Renderer;
use crate::signal::Signal;
use crate::static_files::StaticFiles;
use crate::supervisor::{DevServerOptions, DevServerSupervisor};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Per-application state, mutated only while the app is being configured
pub struct SpaContext {
    fallback: FallbackRouter,
    proxy: ConditionalProxy,
    barrier: StartupBarrier,
    prerender: Option<OnDemandPrerenderer>,
    dev_servers: HashMap<PathBuf, Arc<DevServerSupervisor>>,
}

impl SpaContext {
    pub fn new(public_path: &str) -> Result<Self, SpaError> {
        Ok(Self {
            fallback: FallbackRouter::new(public_path, DEFAULT_PAGE)?,
            proxy: ConditionalProxy::default(),
            barrier: StartupBarrier::new(),
            prerender: None,
            dev_servers: HashMap::new(),
        })
    }

    pub fn with_default_page(mut self, page: &str) -> Result<Self, SpaError> {
        self.fallback = FallbackRouter::new(self.fallback.public_path(), page)?;
        Ok(self)
    }

    /// Replace the proxy's connection pool. Routes added so far are kept.
    pub fn with_pool_config(mut self, config: PoolConfig) -> Self {
        let mut proxy = ConditionalProxy::new(config);
        proxy.set_resolution_timeout(self.proxy.resolution_timeout());
        for route in self.proxy.routes() {
            proxy.add_route(route.clone());
        }
        self.proxy = proxy;
        self
    }

    pub fn with_resolution_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.proxy.set_resolution_timeout(timeout);
        self
    }

    pub fn public_path(&self) -> &str {
        self.fallback.public_path()
    }

    pub fn default_document(&self) -> &str {
        self.fallback.default_document()
    }

    pub fn barrier(&self) -> &StartupBarrier {
        &self.barrier
    }

    pub fn routes(&self) -> &[BackendRoute] {
        self.proxy.routes()
    }

    /// Gate prerendering on another subsystem's startup
    pub fn add_startup_task(&self, task: Signal<()>) {
        self.barrier.register(task);
    }

    pub fn add_route(&mut self, route: BackendRoute) {
        self.proxy.add_route(route);
    }

    /// Start a dev server for `options.source_path` and proxy the public path
    /// to it. A second call for the same source path returns the running one.
    pub fn use_dev_server(&mut self, options: DevServerOptions) -> Result<Arc<DevServerSupervisor>, SpaError> {
        if let Some(existing) = self.dev_servers.get(&options.source_path) {
            warn!(source_path = %options.source_path.display(), "Dev server already registered");
            return Ok(Arc::clone(existing));
        }

        let public_path = self.fallback.public_path().to_string();
        let supervisor = DevServerSupervisor::start(options, &public_path)?;
        let options = supervisor.options();

        self.proxy.add_route(
            BackendRoute::new(public_path.clone(), supervisor.port())
                .with_host(options.host.clone())
                .with_timeout(options.request_timeout),
        );

        for prefix in &options.streaming_paths {
            self.proxy.add_route(
                BackendRoute::new(prefix.clone(), supervisor.port())
                    .with_host(options.host.clone())
                    .without_timeout(),
            );
        }

        self.barrier.register(supervisor.ready().map(|_| ()));
        self.dev_servers
            .insert(options.source_path.clone(), Arc::clone(&supervisor));

        info!(
            source_path = %options.source_path.display(),
            public_path = %public_path,
            "Dev server registered"
        );
        Ok(supervisor)
    }

    /// The supervisor started for `source_path`, if any
    pub fn dev_server(&self, source_path: &Path) -> Option<Arc<DevServerSupervisor>> {
        self.dev_servers.get(source_path).cloned()
    }

    pub fn use_prerendering(
        &mut self,
        entry_point: &str,
        renderer: Arc<dyn Renderer>,
        build: Option<Arc<dyn PrerenderBuild>>,
    ) -> Result<(), SpaError> {
        let prerenderer = OnDemandPrerenderer::new(
            entry_point,
            renderer,
            build,
            self.barrier.clone(),
            self.fallback.default_document(),
        )?;
        info!(entry_point = %prerenderer.entry_point(), "Prerendering enabled");
        self.prerender = Some(prerenderer);
        Ok(())
    }

    /// Freeze the configuration into the request handler
    pub fn into_app(self, static_files: Arc<dyn StaticFiles>) -> SpaApp {
        SpaApp {
            fallback: self.fallback,
            proxy: self.proxy,
            prerender: self.prerender,
            static_files,
            dev_servers: self.dev_servers.into_values().collect(),
        }
    }
}

/// Read-only request pipeline: fallback rewrite, then prerender, proxy or static files
pub struct SpaApp {
    fallback: FallbackRouter,
    proxy: ConditionalProxy,
    prerender: Option<OnDemandPrerenderer>,
    static_files: Arc<dyn StaticFiles>,
    dev_servers: Vec<Arc<DevServerSupervisor>>,
}

impl SpaApp {
    pub fn proxy(&self) -> &ConditionalProxy {
        &self.proxy
    }

    pub async fn handle(&self, mut req: SpaRequest) -> SpaResponse {
        self.fallback.apply(&mut req);

        // The rewritten default document lies under the public path, so
        // tagged requests must reach the prerenderer before the proxy
        if let Some(ref prerender) = self.prerender {
            if is_fallback(&req) {
                return match prerender.render(&req).await {
                    Ok(response) => response,
                    Err(e) => self.error_response(e),
                };
            }
        }

        match self.proxy.handle(req).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => self.error_response(e),
            Err(req) => self.static_files.serve(req).await,
        }
    }

    fn error_response(&self, e: SpaError) -> SpaResponse {
        error!(error = %e, code = e.code().as_header_value(), "Request failed");
        e.into_response()
    }

    /// Stop every dev server this app started
    pub async fn shutdown(&self) {
        for supervisor in &self.dev_servers {
            supervisor.shutdown().await;
        }
    }
}
