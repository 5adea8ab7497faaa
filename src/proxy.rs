//! Streaming reverse proxy from `/proxy/{name}/...` to a backend instance

use crate::error::json_error_response;
use crate::launcher::Launch;
use crate::registry::InstanceRegistry;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::LOCATION;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Path prefix routed to backend instances
pub const PROXY_PREFIX: &str = "/proxy/";

/// Split `/proxy/{name}{subpath}` into its name and subpath.
///
/// The subpath keeps its leading slash and is empty for `/proxy/{name}`.
/// Returns `None` outside the prefix or when the name is empty.
pub fn split_proxy_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix(PROXY_PREFIX)?;
    let (name, subpath) = match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };
    if name.is_empty() {
        return None;
    }
    Some((name, subpath))
}

/// Forwards requests to the backend that owns an instance name.
///
/// Bodies stream in both directions and the backend's response bytes are
/// relayed untouched, compressed or not.
pub struct ProxyHandler<L: Launch> {
    registry: Arc<InstanceRegistry<L>>,
    client: Client<HttpConnector, BoxBody<Bytes, hyper::Error>>,
}

impl<L: Launch> ProxyHandler<L> {
    pub fn new(registry: Arc<InstanceRegistry<L>>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        Self { registry, client }
    }

    /// Relay `req` to `subpath` on the backend serving `name`.
    ///
    /// An empty subpath is redirected to the same path with a trailing slash
    /// before the name is looked up, so the backend's relative asset URLs
    /// resolve below the instance prefix.
    pub async fn proxy(
        &self,
        name: &str,
        subpath: &str,
        req: Request<BoxBody<Bytes, hyper::Error>>,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        if subpath.is_empty() {
            return redirect_with_trailing_slash(&req);
        }

        let port = match self.registry.get(name) {
            Some(info) => info.port,
            None => {
                return json_error_response(
                    StatusCode::NOT_FOUND,
                    format!("instance not found: {}", name),
                )
            }
        };

        let uri = match req.uri().query() {
            Some(query) => format!("http://127.0.0.1:{}{}?{}", port, subpath, query),
            None => format!("http://127.0.0.1:{}{}", port, subpath),
        };
        debug!(name, method = %req.method(), uri = %uri, "Proxying request");

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }
        let backend_req = match builder.body(body) {
            Ok(backend_req) => backend_req,
            Err(e) => {
                warn!(name, uri = %uri, error = %e, "Failed to build backend request");
                return json_error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
            }
        };

        match self.client.request(backend_req).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                let name = name.to_string();
                let body = body
                    .map_err(move |e| {
                        warn!(name = %name, error = %e, "Backend response body failed mid-stream");
                        e
                    })
                    .boxed();
                Response::from_parts(parts, body)
            }
            Err(e) => {
                warn!(name, port, error = %e, "Failed to forward request to backend");
                json_error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}

fn redirect_with_trailing_slash<B>(req: &Request<B>) -> Response<BoxBody<Bytes, hyper::Error>> {
    let location = match req.uri().query() {
        Some(query) => format!("{}/?{}", req.uri().path(), query),
        None => format!("{}/", req.uri().path()),
    };

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(LOCATION, location)
        .body(Empty::new().map_err(|never| match never {}).boxed())
        .unwrap_or_else(|e| json_error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::testing::FakeLauncher;
    use crate::registry::RegistrySettings;
    use http_body_util::{Full, StreamBody};
    use hyper::body::{Frame, Incoming};
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::path::{Path, PathBuf};
    use tokio::net::TcpListener;

    fn settings() -> RegistrySettings {
        RegistrySettings {
            base_dir: PathBuf::from("/tmp"),
            default_reload_interval_secs: 30,
            purge_orphaned_data: true,
            shutdown_grace_period: Duration::from_secs(1),
        }
    }

    fn handler(port: Option<u16>) -> ProxyHandler<FakeLauncher> {
        let launcher = FakeLauncher {
            port,
            ..FakeLauncher::default()
        };
        ProxyHandler::new(InstanceRegistry::new(launcher, settings()))
    }

    fn request(method: &str, uri: &str, body: &'static str) -> Request<BoxBody<Bytes, hyper::Error>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("x-test", "abc")
            .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
            .unwrap()
    }

    /// Echoes the request line and body, and answers with a pre-compressed body
    async fn upstream(req: Request<Incoming>) -> Result<Response<BoxBody<Bytes, Infallible>>, Infallible> {
        let seen = format!("{} {}", req.method(), req.uri());
        let header = req
            .headers()
            .get("x-test")
            .map(|v| v.to_str().unwrap_or_default().to_string())
            .unwrap_or_default();

        let body = match req.uri().path() {
            "/gzip" => StreamBody::new(futures::stream::iter(vec![
                Ok::<_, Infallible>(Frame::data(Bytes::from_static(&[0x1f, 0x8b, 0x08, 0x00]))),
                Ok(Frame::data(Bytes::from_static(&[0xde, 0xad]))),
            ]))
            .boxed(),
            _ => {
                let received = req.into_body().collect().await.map(|b| b.to_bytes()).unwrap_or_default();
                Full::new(received).boxed()
            }
        };

        Ok(Response::builder()
            .header("x-seen", seen)
            .header("x-echo-test", header)
            .header("content-encoding", "gzip")
            .body(body)
            .unwrap())
    }

    async fn spawn_upstream() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service_fn(upstream))
                        .await;
                });
            }
        });
        port
    }

    #[test]
    fn test_split_proxy_path() {
        assert_eq!(split_proxy_path("/proxy/1"), Some(("1", "")));
        assert_eq!(split_proxy_path("/proxy/1/"), Some(("1", "/")));
        assert_eq!(
            split_proxy_path("/proxy/12/data/plugins_listing"),
            Some(("12", "/data/plugins_listing"))
        );
        assert_eq!(split_proxy_path("/proxy/"), None);
        assert_eq!(split_proxy_path("/proxy//x"), None);
        assert_eq!(split_proxy_path("/api/instances"), None);
    }

    #[tokio::test]
    async fn test_empty_subpath_redirects() {
        let proxy = handler(None);

        let response = proxy.proxy("1", "", request("GET", "/proxy/1", "")).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers().get(LOCATION).unwrap(), "/proxy/1/");
    }

    #[tokio::test]
    async fn test_redirect_keeps_query() {
        let proxy = handler(None);

        let response = proxy.proxy("1", "", request("GET", "/proxy/1?a=b&c=d", "")).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers().get(LOCATION).unwrap(), "/proxy/1/?a=b&c=d");
    }

    #[tokio::test]
    async fn test_unknown_instance_is_not_found() {
        let proxy = handler(None);

        let response = proxy.proxy("9", "/", request("GET", "/proxy/9/", "")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"{"message":"instance not found: 9"}"#);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_server_error() {
        let proxy = handler(None);
        let info = proxy
            .registry
            .get_or_create(Path::new("/tmp/unreachable"), None)
            .await
            .unwrap();

        let uri = format!("/proxy/{}/", info.name);
        let response = proxy.proxy(&info.name, "/", request("GET", &uri, "")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        proxy.registry.terminate_all(true).await;
    }

    #[tokio::test]
    async fn test_forwards_method_query_headers_and_body() {
        let port = spawn_upstream().await;
        let proxy = handler(Some(port));
        let info = proxy
            .registry
            .get_or_create(Path::new("/tmp/forward"), None)
            .await
            .unwrap();

        let response = proxy
            .proxy("1", "/echo", request("POST", "/proxy/1/echo?run=train", "payload"))
            .await;
        assert_eq!(info.name, "1");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-seen").unwrap(), "POST /echo?run=train");
        assert_eq!(response.headers().get("x-echo-test").unwrap(), "abc");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"payload");

        proxy.registry.terminate_all(true).await;
    }

    #[tokio::test]
    async fn test_compressed_body_is_relayed_verbatim() {
        let port = spawn_upstream().await;
        let proxy = handler(Some(port));
        proxy
            .registry
            .get_or_create(Path::new("/tmp/gzip"), None)
            .await
            .unwrap();

        let response = proxy.proxy("1", "/gzip", request("GET", "/proxy/1/gzip", "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-encoding").unwrap(), "gzip");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], &[0x1f, 0x8b, 0x08, 0x00, 0xde, 0xad]);

        proxy.registry.terminate_all(true).await;
    }
}
