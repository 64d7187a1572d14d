//! Spagate - A development-time host for single-page applications
//!
//! This library routes each request of a SPA host to one of:
//! - A front-end build-tool dev server, spawned as a child process whose port
//!   is only known once it reports it on stdout
//! - A server-side prerender of the default document, gated on every startup
//!   task and on an on-demand build that runs at most once
//! - Static files, for everything else
//!
//! Requests that arrive before the dev server is ready wait on its port
//! instead of failing.

pub mod barrier;
pub mod body;
pub mod config;
pub mod context;
pub mod error;
pub mod fallback;
pub mod pool;
pub mod port;
pub mod prerender;
pub mod proxy;
pub mod render;
pub mod server;
pub mod signal;
pub mod static_files;
pub mod supervisor;

pub use context::{SpaApp, SpaContext};
pub use error::SpaError;
