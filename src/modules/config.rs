//! Process-wide configuration and the derived timeout budget.

use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use super::constants::{BACKEND_DEADLINE, FRESH_THRESHOLD};
use super::error::{Error, Result};

/// Immutable settings loaded once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Base URL of the secrets backend.
    pub server_url: Url,
    /// PEM-encoded client certificate. Empty means the key file holds both.
    pub cert_file: PathBuf,
    /// PEM-encoded private key.
    pub key_file: PathBuf,
    /// PEM-encoded CA bundle used to verify the backend.
    pub ca_file: PathBuf,
    /// Default user reported as owner of exposed files.
    pub user: String,
    /// Default group reported as owner of exposed files.
    pub group: String,
    /// Check backend connectivity while building the client.
    pub ping: bool,
    /// Verbose logging.
    pub debug: bool,
    /// Timeout for communication with the backend.
    pub timeout: Duration,
}

impl Config {
    /// Builds a configuration, validating the backend URL.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server_url: &str,
        cert_file: impl Into<PathBuf>,
        key_file: impl Into<PathBuf>,
        ca_file: impl Into<PathBuf>,
        user: impl Into<String>,
        group: impl Into<String>,
        ping: bool,
        debug: bool,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            server_url: parse_server_url(server_url)?,
            cert_file: cert_file.into(),
            key_file: key_file.into(),
            ca_file: ca_file.into(),
            user: user.into(),
            group: group.into(),
            ping,
            debug,
            timeout,
        })
    }

    /// Derives the timeout budget handed to the filesystem.
    pub fn timeout_budget(&self) -> TimeoutBudget {
        TimeoutBudget::new(self.timeout)
    }
}

fn parse_server_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| Error::Configuration(format!("invalid server url {raw:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(Error::Configuration(format!(
            "unsupported url scheme {other:?} in {raw:?}"
        ))),
    }
}

/// Time limits governing cached versus live data in the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutBudget {
    /// How recently data must have been fetched to count as fresh.
    pub fresh: Duration,
    /// Deadline for a single backend call.
    pub backend_deadline: Duration,
    /// Longest a caller waits for data, cached or not.
    pub max_wait: Duration,
}

impl TimeoutBudget {
    /// `max_wait` is the configured timeout plus the backend deadline.
    pub fn new(timeout: Duration) -> Self {
        Self {
            fresh: FRESH_THRESHOLD,
            backend_deadline: BACKEND_DEADLINE,
            max_wait: timeout + BACKEND_DEADLINE,
        }
    }
}
