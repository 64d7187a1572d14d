//! Port discovery for dev servers whose port is only known at runtime

use crate::error::SpaError;
use regex::Regex;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::OnceLock;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tracing::debug;

/// Default "server ready" pattern. Matches the Angular CLI banner
/// (`... is listening on localhost:4200, open your browser on http://localhost:4200/ **`)
/// and generic `listening on http://127.0.0.1:51234` lines.
pub const DEFAULT_READY_PATTERN: &str =
    r"(?i)\b(?:listening|running|available|open your browser)\b.*?https?://[^\s/]+:(?P<port>\d{1,5})\b";

/// Ask the OS for a free loopback port.
///
/// The listener is dropped before returning, so this is not a reservation:
/// another process may grab the port before the caller binds it.
pub fn acquire_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Recognises the line a dev server prints once it is accepting connections
#[derive(Debug, Clone)]
pub struct ReadyLineMatcher {
    pattern: Regex,
}

impl ReadyLineMatcher {
    /// Compile a custom pattern. It must contain a named `port` group.
    pub fn new(pattern: &str) -> Result<Self, SpaError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| SpaError::Configuration(format!("invalid ready pattern: {}", e)))?;
        if !pattern.capture_names().any(|name| name == Some("port")) {
            return Err(SpaError::Configuration(
                "ready pattern must contain a named `port` capture group".to_string(),
            ));
        }
        Ok(Self { pattern })
    }

    /// Extract the port from `line` if it is a ready line
    pub fn match_port(&self, line: &str) -> Option<u16> {
        let captures = self.pattern.captures(line)?;
        let port: u16 = captures.name("port")?.as_str().parse().ok()?;
        (port != 0).then_some(port)
    }
}

impl Default for ReadyLineMatcher {
    fn default() -> Self {
        static DEFAULT: OnceLock<Regex> = OnceLock::new();
        let pattern = DEFAULT
            .get_or_init(|| Regex::new(DEFAULT_READY_PATTERN).expect("default ready pattern compiles"))
            .clone();
        Self { pattern }
    }
}

/// Read lines until one matches and return its port, handing every line read
/// (the ready line included) to `on_line`.
///
/// Returns `None` if the source ends or fails first. `lines` is left
/// positioned after the ready line, so callers can keep draining it.
pub async fn scan_for_ready_port<R, F>(
    lines: &mut Lines<R>,
    matcher: &ReadyLineMatcher,
    mut on_line: F,
) -> Option<u16>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(&str),
{
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                on_line(&line);
                if let Some(port) = matcher.match_port(&line) {
                    debug!(port, "Ready line matched");
                    return Some(port);
                }
            }
            Ok(None) => return None,
            Err(e) => {
                debug!(error = %e, "Line source failed before a ready line");
                return None;
            }
        }
    }
}

/// Read lines until one matches, then return its port.
///
/// If the source ends or fails before a match the returned future never
/// completes; race it against a deadline.
pub async fn parse_port_from_reader<R>(reader: R, matcher: &ReadyLineMatcher) -> u16
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    match scan_for_ready_port(&mut lines, matcher, |_| {}).await {
        Some(port) => port,
        None => std::future::pending().await,
    }
}
