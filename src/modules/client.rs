//! Authenticated HTTP client for the secrets backend.

use log::{debug, info};
use reqwest::blocking::Client;
use reqwest::{Certificate, Identity};
use std::fs;
use std::path::Path;
use std::time::Duration;
use url::Url;

use super::config::Config;
use super::constants::STATUS_ENDPOINT;
use super::error::{Error, Result};

/// Mutually-authenticated client bound to one backend URL.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: Client,
    base_url: Url,
}

impl BackendClient {
    /// Builds the client from the configured credentials.
    ///
    /// With `config.ping` set, the backend is contacted once before
    /// returning and any failure aborts construction.
    pub fn new(config: &Config) -> Result<Self> {
        let identity = load_identity(&config.cert_file, &config.key_file)?;
        let ca = read_pem(&config.ca_file)?;
        let ca = Certificate::from_pem(&ca).map_err(|e| {
            Error::backend(format!("invalid CA file {}: {e}", config.ca_file.display()))
        })?;

        let http = Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .add_root_certificate(ca)
            .timeout(config.timeout)
            .build()
            .map_err(Error::backend)?;

        let client = Self {
            http,
            base_url: config.server_url.clone(),
        };

        if config.ping {
            client.ping()?;
            info!("Backend {} is reachable", client.base_url);
        }

        Ok(client)
    }

    /// Checks that the backend answers its status endpoint.
    pub fn ping(&self) -> Result<()> {
        self.status(None).map(|_| ())
    }

    /// Fetches the backend status body, optionally bounded by `deadline`.
    pub fn status(&self, deadline: Option<Duration>) -> Result<String> {
        let url = self.base_url.join(STATUS_ENDPOINT).map_err(Error::backend)?;
        debug!("GET {}", url);

        let mut request = self.http.get(url.clone());
        if let Some(deadline) = deadline {
            request = request.timeout(deadline);
        }

        let response = request
            .send()
            .map_err(|e| Error::backend(format!("GET {url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::backend(format!("GET {url}: unexpected status {status}")));
        }
        response.text().map_err(Error::backend)
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::backend(format!("reading {}: {e}", path.display())))
}

// An empty certificate path means the key file carries both halves.
fn load_identity(cert_file: &Path, key_file: &Path) -> Result<Identity> {
    let mut pem = Vec::new();
    if !cert_file.as_os_str().is_empty() {
        pem.extend(read_pem(cert_file)?);
        pem.push(b'\n');
    }
    pem.extend(read_pem(key_file)?);

    Identity::from_pem(&pem).map_err(|e| {
        Error::backend(format!("invalid client identity {}: {e}", key_file.display()))
    })
}
