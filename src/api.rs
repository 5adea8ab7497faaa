//! JSON control API for instances under `/api/instances`

use crate::error::{json_error_response, InstanceError};
use crate::launcher::Launch;
use crate::registry::{InstanceInfo, InstanceRegistry};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, Limited};
use hyper::body::Bytes;
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const INSTANCES_PATH: &str = "/api/instances";

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Public view of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceView {
    pub name: String,
    pub logdir: String,
    pub reload_time: u64,
}

impl From<InstanceInfo> for InstanceView {
    fn from(info: InstanceInfo) -> Self {
        Self {
            name: info.name,
            logdir: info.directory.display().to_string(),
            reload_time: info.reload_interval,
        }
    }
}

/// Body of `POST /api/instances`
#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub logdir: String,
    /// Seconds between reloads; missing or non-positive uses the default
    #[serde(default)]
    pub reload_interval: Option<i64>,
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .unwrap_or_else(|e| json_error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

fn serialized<T: Serialize>(value: &T) -> Response<BoxBody<Bytes, hyper::Error>> {
    match serde_json::to_vec(value) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => json_error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn no_content() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Empty::new().map_err(|never| match never {}).boxed())
        .unwrap_or_else(|e| json_error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// Whether `path` belongs to the control API
pub fn is_api_path(path: &str) -> bool {
    path == INSTANCES_PATH
        || path
            .strip_prefix(INSTANCES_PATH)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Route a control API request.
///
/// | Method | Path | |
/// |--------|------|-|
/// | GET | `/api/instances` | list instances |
/// | POST | `/api/instances` | get or create the instance for a logdir |
/// | GET | `/api/instances/{name}` | one instance |
/// | DELETE | `/api/instances/{name}` | terminate an instance |
pub async fn handle_api_request<L: Launch>(
    registry: &Arc<InstanceRegistry<L>>,
    req: Request<BoxBody<Bytes, hyper::Error>>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if path == INSTANCES_PATH {
        return match method {
            Method::GET => list_instances(registry),
            Method::POST => create_instance(registry, req).await,
            _ => method_not_allowed(&method, &path),
        };
    }

    let name = match path.strip_prefix(INSTANCES_PATH).and_then(|rest| rest.strip_prefix('/')) {
        Some(name) if !name.is_empty() && !name.contains('/') => name,
        _ => return json_error_response(StatusCode::NOT_FOUND, "not found"),
    };

    match method {
        Method::GET => get_instance(registry, name),
        Method::DELETE => delete_instance(registry, name).await,
        _ => method_not_allowed(&method, &path),
    }
}

fn method_not_allowed(method: &Method, path: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    debug!(%method, path, "Method not allowed");
    json_error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

fn list_instances<L: Launch>(registry: &InstanceRegistry<L>) -> Response<BoxBody<Bytes, hyper::Error>> {
    let views: Vec<InstanceView> = registry.list().into_iter().map(InstanceView::from).collect();
    serialized(&views)
}

fn get_instance<L: Launch>(registry: &InstanceRegistry<L>, name: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    match registry.get(name) {
        Some(info) => serialized(&InstanceView::from(info)),
        None => InstanceError::NotFound(name.to_string()).into_response(),
    }
}

async fn create_instance<L: Launch>(
    registry: &Arc<InstanceRegistry<L>>,
    req: Request<BoxBody<Bytes, hyper::Error>>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            return json_error_response(StatusCode::BAD_REQUEST, format!("invalid request body: {}", e));
        }
    };

    let request: CreateRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return json_error_response(StatusCode::BAD_REQUEST, format!("invalid request body: {}", e));
        }
    };
    if request.logdir.trim().is_empty() {
        return json_error_response(StatusCode::BAD_REQUEST, "logdir must not be empty");
    }

    match registry
        .get_or_create(Path::new(&request.logdir), request.reload_interval)
        .await
    {
        Ok(info) => {
            info!(name = %info.name, logdir = %info.directory.display(), "Instance ready");
            serialized(&InstanceView::from(info))
        }
        Err(e) => {
            warn!(logdir = %request.logdir, error = %e, "Failed to create instance");
            e.into_response()
        }
    }
}

async fn delete_instance<L: Launch>(
    registry: &InstanceRegistry<L>,
    name: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    match registry.terminate(name, true).await {
        Ok(()) => no_content(),
        Err(e) => e.into_response(),
    }
}
