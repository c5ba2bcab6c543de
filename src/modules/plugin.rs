//! Docker volume plugin protocol over a Unix socket.
//!
//! Each endpoint is an HTTP POST carrying a small JSON document. This
//! module only translates between that wire format and
//! [`VolumeDriver`]; driver calls block, so they run on the blocking pool.

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response, StatusCode};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::fs;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixListener;

use super::constants::PLUGIN_CONTENT_TYPE;
use super::driver::VolumeDriver;
use super::startup::ServerLauncher;

/// Body of every `VolumeDriver.*` request.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub opts: Option<HashMap<String, String>>,
    #[serde(default, rename = "ID")]
    pub id: String,
}

/// Volume description used by `Get` and `List`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeInfo {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mountpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Capabilities {
    pub scope: String,
}

/// Body of every `VolumeDriver.*` response.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub err: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<VolumeInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
}

impl VolumeResponse {
    fn error(err: impl ToString) -> Self {
        Self {
            err: err.to_string(),
            ..Default::default()
        }
    }

    fn mountpoint(path: &Path) -> Self {
        Self {
            mountpoint: Some(path.display().to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActivateResponse {
    pub implements: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Activate(ActivateResponse),
    Volume(VolumeResponse),
}

/// Plugin protocol endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Activate,
    Create,
    Remove,
    Path,
    Mount,
    Unmount,
    Get,
    List,
    Capabilities,
}

impl Route {
    pub fn from_path(path: &str) -> Option<Self> {
        let route = match path {
            "/Plugin.Activate" => Self::Activate,
            "/VolumeDriver.Create" => Self::Create,
            "/VolumeDriver.Remove" => Self::Remove,
            "/VolumeDriver.Path" => Self::Path,
            "/VolumeDriver.Mount" => Self::Mount,
            "/VolumeDriver.Unmount" => Self::Unmount,
            "/VolumeDriver.Get" => Self::Get,
            "/VolumeDriver.List" => Self::List,
            "/VolumeDriver.Capabilities" => Self::Capabilities,
            _ => return None,
        };
        Some(route)
    }

    /// Routes whose reply or side effect depends on a path under the root.
    ///
    /// Create and Remove never touch the filesystem and accept any name.
    fn resolves_mountpoint(self) -> bool {
        matches!(self, Self::Path | Self::Mount | Self::Unmount | Self::Get)
    }
}

/// Parses a request body; an empty body is an empty request.
pub fn decode_request(body: &[u8]) -> Result<VolumeRequest, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(VolumeRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| format!("invalid request body: {e}"))
}

/// Rejects names that would resolve outside the volumes root.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("volume name is required".to_string());
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(format!("invalid volume name {name:?}"));
    }
    Ok(())
}

/// Runs one plugin call against the driver.
pub fn dispatch<L: ServerLauncher>(driver: &VolumeDriver<L>, route: Route, body: &[u8]) -> Reply {
    let request = match decode_request(body) {
        Ok(request) => request,
        Err(e) => return Reply::Volume(VolumeResponse::error(e)),
    };
    if route.resolves_mountpoint() {
        if let Err(e) = validate_name(&request.name) {
            return Reply::Volume(VolumeResponse::error(e));
        }
    }
    let name = request.name.as_str();

    let response = match route {
        Route::Activate => {
            return Reply::Activate(ActivateResponse {
                implements: vec!["VolumeDriver".to_string()],
            })
        }
        Route::Create => match driver.create(name) {
            Ok(()) => VolumeResponse::default(),
            Err(e) => VolumeResponse::error(e),
        },
        Route::Remove => match driver.remove(name) {
            Ok(()) => VolumeResponse::default(),
            Err(e) => VolumeResponse::error(e),
        },
        Route::Path => VolumeResponse::mountpoint(&driver.path(name)),
        Route::Mount => match driver.mount(name) {
            Ok(m) => VolumeResponse::mountpoint(&m),
            Err(e) => {
                warn!("Mount of {} failed: {}", name, e);
                VolumeResponse::error(e)
            }
        },
        Route::Unmount => match driver.unmount(name) {
            Ok(()) => VolumeResponse::default(),
            Err(e) => {
                warn!("Unmount of {} failed: {}", name, e);
                VolumeResponse::error(e)
            }
        },
        Route::Get => VolumeResponse {
            volume: Some(VolumeInfo {
                name: name.to_string(),
                mountpoint: driver.path(name).display().to_string(),
            }),
            ..Default::default()
        },
        Route::List => VolumeResponse {
            volumes: Some(
                driver
                    .list()
                    .into_iter()
                    .map(|v| VolumeInfo {
                        name: v.name,
                        mountpoint: v.mountpoint.display().to_string(),
                    })
                    .collect(),
            ),
            ..Default::default()
        },
        Route::Capabilities => VolumeResponse {
            capabilities: Some(Capabilities {
                scope: "local".to_string(),
            }),
            ..Default::default()
        },
    };
    Reply::Volume(response)
}

fn respond(status: StatusCode, reply: &Reply) -> Response<Body> {
    let body = serde_json::to_vec(reply).unwrap_or_default();
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(PLUGIN_CONTENT_TYPE));
    response
}

async fn handle<L>(
    driver: Arc<VolumeDriver<L>>,
    request: Request<Body>,
) -> Result<Response<Body>, Infallible>
where
    L: ServerLauncher + 'static,
{
    let path = request.uri().path().to_string();
    debug!("{} {}", request.method(), path);

    let Some(route) = Route::from_path(&path) else {
        let reply = Reply::Volume(VolumeResponse::error(format!("unknown endpoint {path}")));
        return Ok(respond(StatusCode::NOT_FOUND, &reply));
    };
    if request.method() != Method::POST {
        let reply = Reply::Volume(VolumeResponse::error("method not allowed"));
        return Ok(respond(StatusCode::METHOD_NOT_ALLOWED, &reply));
    }

    let body = match hyper::body::to_bytes(request.into_body()).await {
        Ok(body) => body,
        Err(e) => {
            let reply = Reply::Volume(VolumeResponse::error(e));
            return Ok(respond(StatusCode::BAD_REQUEST, &reply));
        }
    };

    match tokio::task::spawn_blocking(move || dispatch(&driver, route, &body)).await {
        Ok(reply) => Ok(respond(StatusCode::OK, &reply)),
        Err(e) => {
            let reply = Reply::Volume(VolumeResponse::error(e));
            Ok(respond(StatusCode::INTERNAL_SERVER_ERROR, &reply))
        }
    }
}

/// Serves the plugin protocol on `socket_path` until `shutdown` resolves.
///
/// A stale socket file is replaced, and the socket is removed on return.
pub async fn serve<L, F>(
    driver: Arc<VolumeDriver<L>>,
    socket_path: &Path,
    shutdown: F,
) -> anyhow::Result<()>
where
    L: ServerLauncher + 'static,
    F: Future<Output = ()>,
{
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if socket_path.exists() {
        tokio::fs::remove_file(socket_path).await?;
    }

    let listener = UnixListener::bind(socket_path)?;
    fs::set_permissions(socket_path, fs::Permissions::from_mode(0o660))?;
    info!("Listening on {}", socket_path.display());

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let driver = Arc::clone(&driver);
                    tokio::spawn(async move {
                        let service = service_fn(move |request| handle(Arc::clone(&driver), request));
                        if let Err(e) = Http::new()
                            .http1_only(true)
                            .serve_connection(stream, service)
                            .await
                        {
                            debug!("Plugin connection error: {}", e);
                        }
                    });
                }
                Err(e) => warn!("Plugin accept error: {}", e),
            }
        }
    }

    info!("Closing {}", socket_path.display());
    if let Err(e) = tokio::fs::remove_file(socket_path).await {
        warn!("Failed to remove {}: {}", socket_path.display(), e);
    }
    Ok(())
}
