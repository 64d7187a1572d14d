//! HTTP hosting for a [`SpaApp`]

use crate::body::SpaResponse;
use crate::context::SpaApp;
use crate::proxy::{ClientAddr, X_REQUEST_ID};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

pub struct SpaServer {
    bind_addr: SocketAddr,
    app: Arc<SpaApp>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SpaServer {
    pub fn new(bind_addr: SocketAddr, app: Arc<SpaApp>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            app,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "SPA server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let app = Arc::clone(&self.app);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, app).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("SPA server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, app: Arc<SpaApp>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let app = Arc::clone(&app);
        async move { Ok::<_, Infallible>(handle_request(req, app, addr).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(req: Request<Incoming>, app: Arc<SpaApp>, client_addr: SocketAddr) -> SpaResponse {
    let mut req = req.map(|body| body.boxed());
    req.extensions_mut().insert(ClientAddr(client_addr));

    let request_id = match req.headers().get(X_REQUEST_ID).cloned() {
        Some(id) => id,
        None => {
            let id = HeaderValue::from_str(&Uuid::new_v4().to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("unknown"));
            req.headers_mut().insert(X_REQUEST_ID, id.clone());
            id
        }
    };

    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let mut response = app.handle(req).await;

    debug!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        request_id = request_id.to_str().unwrap_or(""),
        "Request handled"
    );

    response.headers_mut().insert(X_REQUEST_ID, request_id);
    response
}
