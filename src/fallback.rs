//! SPA fallback routing
//!
//! Requests outside the public path are rewritten to the default document and
//! tagged with [`SpaFallback`], so later handlers can prerender or serve it.

use crate::error::SpaError;
use hyper::http::uri::{PathAndQuery, Uri};
use hyper::Request;
use std::str::FromStr;
use tracing::{debug, warn};

pub const DEFAULT_PAGE: &str = "index.html";

/// Request extension marking a request as rewritten to the default document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaFallback;

/// Whether `path` equals `prefix` or lies beneath it, segment-wise and
/// ignoring ASCII case. `/dist` covers `/dist` and `/dist/a.js`, not `/distx`.
pub fn starts_with_segments(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => {
            matches!(path.as_bytes().get(prefix.len()), None | Some(b'/'))
        }
        _ => false,
    }
}

/// Join the public path and the default page into the default document path
pub fn default_document_path(public_path: &str, page: &str) -> Result<String, SpaError> {
    if public_path.is_empty() {
        return Err(SpaError::Configuration("public path cannot be empty".to_string()));
    }
    if !public_path.starts_with('/') {
        return Err(SpaError::Configuration(format!(
            "public path '{}' must start with '/'",
            public_path
        )));
    }
    let page = page.trim_start_matches('/');
    if page.is_empty() {
        return Err(SpaError::Configuration("default page cannot be empty".to_string()));
    }

    let path = format!("{}/{}", public_path.trim_end_matches('/'), page);
    PathAndQuery::from_str(&path)
        .map_err(|e| SpaError::Configuration(format!("invalid default document '{}': {}", path, e)))?;
    Ok(path)
}

#[derive(Debug, Clone)]
pub struct FallbackRouter {
    public_path: String,
    default_document: String,
}

impl FallbackRouter {
    pub fn new(public_path: &str, default_page: &str) -> Result<Self, SpaError> {
        let default_document = default_document_path(public_path, default_page)?;
        Ok(Self {
            public_path: public_path.to_string(),
            default_document,
        })
    }

    pub fn public_path(&self) -> &str {
        &self.public_path
    }

    pub fn default_document(&self) -> &str {
        &self.default_document
    }

    /// Returns the path to continue with and whether it is a fallback
    pub fn route(&self, path: &str) -> (String, bool) {
        if starts_with_segments(path, &self.public_path) {
            (path.to_string(), false)
        } else {
            (self.default_document.clone(), true)
        }
    }

    /// Rewrite `req` in place, keeping its query string. Returns true if the
    /// request was tagged as a fallback.
    pub fn apply<B>(&self, req: &mut Request<B>) -> bool {
        let (path, is_fallback) = self.route(req.uri().path());
        if !is_fallback {
            return false;
        }

        let path_and_query = match req.uri().query() {
            Some(query) => format!("{}?{}", path, query),
            None => path,
        };
        let mut parts = req.uri().clone().into_parts();
        match PathAndQuery::from_str(&path_and_query) {
            Ok(pq) => parts.path_and_query = Some(pq),
            Err(e) => {
                warn!(error = %e, "Could not rewrite request path");
                return false;
            }
        }
        match Uri::from_parts(parts) {
            Ok(uri) => {
                debug!(from = %req.uri().path(), to = %uri.path(), "SPA fallback");
                *req.uri_mut() = uri;
            }
            Err(e) => {
                warn!(error = %e, "Could not rewrite request URI");
                return false;
            }
        }

        req.extensions_mut().insert(SpaFallback);
        true
    }
}

/// Whether an earlier [`FallbackRouter::apply`] tagged this request
pub fn is_fallback<B>(req: &Request<B>) -> bool {
    req.extensions().get::<SpaFallback>().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> FallbackRouter {
        FallbackRouter::new("/dist", DEFAULT_PAGE).unwrap()
    }

    #[test]
    fn test_starts_with_segments() {
        assert!(starts_with_segments("/dist", "/dist"));
        assert!(starts_with_segments("/dist/", "/dist"));
        assert!(starts_with_segments("/dist/app.js", "/dist/"));
        assert!(starts_with_segments("/Dist/App.js", "/dist"));
        assert!(!starts_with_segments("/distribution", "/dist"));
        assert!(!starts_with_segments("/di", "/dist"));
        assert!(starts_with_segments("/anything", "/"));
    }

    #[test]
    fn test_default_document_path() {
        assert_eq!(default_document_path("/dist", "index.html").unwrap(), "/dist/index.html");
        assert_eq!(default_document_path("/dist/", "/index.html").unwrap(), "/dist/index.html");
        assert_eq!(default_document_path("/", "app.html").unwrap(), "/app.html");
        assert!(matches!(
            default_document_path("", "index.html"),
            Err(SpaError::Configuration(_))
        ));
        assert!(matches!(
            default_document_path("dist", "index.html"),
            Err(SpaError::Configuration(_))
        ));
        assert!(matches!(
            default_document_path("/dist", ""),
            Err(SpaError::Configuration(_))
        ));
    }

    #[test]
    fn test_paths_outside_public_path_fall_back() {
        let router = router();
        for path in ["/", "/about", "/users/42/edit", "/distribution", "/favicon.ico"] {
            let (rewritten, is_fallback) = router.route(path);
            assert_eq!(rewritten, "/dist/index.html", "path {}", path);
            assert!(is_fallback, "path {}", path);

            let (again, again_fallback) = router.route(&rewritten);
            assert_eq!(again, rewritten);
            assert!(!again_fallback);
        }
    }

    #[test]
    fn test_paths_under_public_path_are_untouched() {
        let router = router();
        assert_eq!(router.route("/dist/app.js"), ("/dist/app.js".to_string(), false));
        assert_eq!(router.route("/dist"), ("/dist".to_string(), false));
    }

    #[test]
    fn test_apply_rewrites_and_tags() {
        let router = router();
        let mut req = Request::builder()
            .uri("http://localhost:5000/about?tab=team")
            .body(())
            .unwrap();

        assert!(router.apply(&mut req));
        assert_eq!(req.uri().path(), "/dist/index.html");
        assert_eq!(req.uri().query(), Some("tab=team"));
        assert_eq!(req.uri().host(), Some("localhost"));
        assert!(is_fallback(&req));

        let mut asset = Request::builder().uri("/dist/main.js").body(()).unwrap();
        assert!(!router.apply(&mut asset));
        assert_eq!(asset.uri().path(), "/dist/main.js");
        assert!(!is_fallback(&asset));
    }
}
