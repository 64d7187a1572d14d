//! Terminal static-file handlers

use crate::body::{empty, full, SpaRequest, SpaResponse};
use crate::error::{json_error_response, ErrorCode};
use async_trait::async_trait;
use hyper::header::{ALLOW, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Response, StatusCode};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Last handler in the chain, given the request after fallback rewriting
#[async_trait]
pub trait StaticFiles: Send + Sync {
    async fn serve(&self, req: SpaRequest) -> SpaResponse;
}

/// Answers every request with 404
#[derive(Debug, Clone, Copy, Default)]
pub struct NotFound;

#[async_trait]
impl StaticFiles for NotFound {
    async fn serve(&self, req: SpaRequest) -> SpaResponse {
        json_error_response(ErrorCode::NotFound, format!("no file at {}", req.uri().path()))
    }
}

/// Serves GET and HEAD requests from files under `root`
#[derive(Debug, Clone)]
pub struct ServeDir {
    root: PathBuf,
}

impl ServeDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a URL path onto the root. None if it escapes the root.
    fn resolve(&self, url_path: &str) -> Option<PathBuf> {
        let decoded = urlencoding::decode(url_path).ok()?;
        let mut path = self.root.clone();
        for component in Path::new(decoded.trim_start_matches('/')).components() {
            match component {
                Component::Normal(segment) => path.push(segment),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        Some(path)
    }
}

#[async_trait]
impl StaticFiles for ServeDir {
    async fn serve(&self, req: SpaRequest) -> SpaResponse {
        let method = req.method().clone();
        if method != Method::GET && method != Method::HEAD {
            let mut response =
                json_error_response(ErrorCode::MethodNotAllowed, format!("{} is not allowed", method));
            response
                .headers_mut()
                .insert(ALLOW, hyper::header::HeaderValue::from_static("GET, HEAD"));
            return response;
        }

        let url_path = req.uri().path();
        let Some(mut path) = self.resolve(url_path) else {
            warn!(path = %url_path, "Rejected path outside the static root");
            return json_error_response(ErrorCode::NotFound, format!("no file at {}", url_path));
        };

        if tokio::fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false) {
            path.push(crate::fallback::DEFAULT_PAGE);
        }

        match tokio::fs::read(&path).await {
            Ok(contents) => {
                debug!(path = %path.display(), bytes = contents.len(), "Serving static file");
                let builder = Response::builder()
                    .status(StatusCode::OK)
                    .header(CONTENT_TYPE, determine_content_type(&path))
                    .header(CONTENT_LENGTH, contents.len());
                let body = if method == Method::HEAD { empty() } else { full(contents) };
                builder
                    .body(body)
                    .unwrap_or_else(|e| json_error_response(ErrorCode::NotFound, e.to_string()))
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Static file not found");
                json_error_response(ErrorCode::NotFound, format!("no file at {}", url_path))
            }
        }
    }
}

/// Content type from the file extension
fn determine_content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "js" | "mjs" => "application/javascript",
        "css" => "text/css",
        "json" | "map" => "application/json",
        "wasm" => "application/wasm",
        "txt" => "text/plain; charset=utf-8",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        _ => "application/octet-stream",
    }
}
