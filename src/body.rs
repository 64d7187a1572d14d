//! Request and response body types shared by every handler

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Request, Response};

/// Boxed body used for both directions so proxied bodies stream through untouched
pub type SpaBody = BoxBody<Bytes, hyper::Error>;
pub type SpaRequest = Request<SpaBody>;
pub type SpaResponse = Response<SpaBody>;

pub fn full(bytes: impl Into<Bytes>) -> SpaBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

pub fn empty() -> SpaBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}
