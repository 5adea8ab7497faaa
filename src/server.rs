//! Front-end HTTP listener routing control API and proxy requests

use crate::api::{handle_api_request, is_api_path};
use crate::error::json_error_response;
use crate::launcher::Launch;
use crate::proxy::{split_proxy_path, ProxyHandler, PROXY_PREFIX};
use crate::registry::InstanceRegistry;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Shared state behind every connection
struct Routes<L: Launch> {
    registry: Arc<InstanceRegistry<L>>,
    proxy: ProxyHandler<L>,
}

/// The gateway's single listener
pub struct GatewayServer<L: Launch> {
    bind_addr: SocketAddr,
    routes: Arc<Routes<L>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<L: Launch> GatewayServer<L> {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<InstanceRegistry<L>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let proxy = ProxyHandler::new(Arc::clone(&registry));
        Self {
            bind_addr,
            routes: Arc::new(Routes { registry, proxy }),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let routes = Arc::clone(&self.routes);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, routes).await {
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
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<L: Launch>(
    stream: TcpStream,
    addr: SocketAddr,
    routes: Arc<Routes<L>>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let routes = Arc::clone(&routes);
        async move {
            debug!(addr = %addr, method = %req.method(), uri = %req.uri(), "Incoming request");
            Ok::<_, hyper::Error>(route(&routes, req.map(|body| body.boxed())).await)
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn route<L: Launch>(
    routes: &Routes<L>,
    req: Request<BoxBody<Bytes, hyper::Error>>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let path = req.uri().path().to_string();

    if path == "/health" {
        return match *req.method() {
            Method::GET => health(),
            _ => json_error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        };
    }

    if is_api_path(&path) {
        return handle_api_request(&routes.registry, req).await;
    }

    if path.starts_with(PROXY_PREFIX) {
        if let Some((name, subpath)) = split_proxy_path(&path) {
            return routes.proxy.proxy(name, subpath, req).await;
        }
    }

    json_error_response(StatusCode::NOT_FOUND, "not found")
}

fn health() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain")
        .body(Full::new(Bytes::from_static(b"ok")).map_err(|never| match never {}).boxed())
        .unwrap_or_else(|e| json_error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
