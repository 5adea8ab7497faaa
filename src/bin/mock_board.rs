//! Stand-in dashboard backend for integration testing
//!
//! Accepts the backend command line (`--version`, an optional `serve`
//! subcommand, `--port`, `--logdir`, `--bind_all`, `--host`, ...) and serves
//! a handful of fixed routes.
//!
//! Environment variables:
//! - MOCK_BOARD_VERSION: Version printed for `--version` (default: 2.15.1)
//! - MOCK_BOARD_STARTUP_DELAY_MS: Delay before listening (default: 0)

use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const DEFAULT_VERSION: &str = "2.15.1";

/// First bytes of a gzip stream, relayed as-is by the gateway
const GZIP_BYTES: &[u8] = &[0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03];

const FIRST_CHUNK_DELAY: Duration = Duration::from_millis(100);
const NEXT_CHUNK_DELAY: Duration = Duration::from_millis(500);

type MockBody = UnsyncBoxBody<Bytes, Infallible>;

#[derive(Debug, Default)]
struct Args {
    raw: Vec<String>,
    port: Option<u16>,
    logdir: Option<String>,
    host: Option<String>,
    bind_all: bool,
}

fn parse_args(raw: Vec<String>) -> Args {
    let mut args = Args {
        raw: raw.clone(),
        ..Args::default()
    };

    let mut iter = raw.into_iter().peekable();
    if iter.peek().map(String::as_str) == Some("serve") {
        iter.next();
    }
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--bind_all" => args.bind_all = true,
            "--port" => args.port = iter.next().and_then(|p| p.parse().ok()),
            "--logdir" => args.logdir = iter.next(),
            "--host" => args.host = iter.next(),
            flag if flag.starts_with("--") => {
                iter.next();
            }
            _ => {}
        }
    }
    args
}

#[tokio::main]
async fn main() {
    let raw: Vec<String> = env::args().skip(1).collect();

    if raw.iter().any(|a| a == "--version") {
        println!(
            "{}",
            env::var("MOCK_BOARD_VERSION").unwrap_or_else(|_| DEFAULT_VERSION.to_string())
        );
        return;
    }

    let args = Arc::new(parse_args(raw));
    let port = match args.port {
        Some(port) => port,
        None => {
            eprintln!("Mock board: --port is required");
            std::process::exit(2);
        }
    };

    let startup_delay: u64 = env::var("MOCK_BOARD_STARTUP_DELAY_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if startup_delay > 0 {
        eprintln!("Mock board: sleeping for {}ms before starting", startup_delay);
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    let host = match (&args.host, args.bind_all) {
        (Some(host), _) => host.clone(),
        (None, true) => "0.0.0.0".to_string(),
        (None, false) => "127.0.0.1".to_string(),
    };
    let listener = TcpListener::bind(format!("{}:{}", host, port))
        .await
        .expect("Failed to bind");

    eprintln!("Mock board: listening on {}:{} for {:?}", host, port, args.logdir);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let args = Arc::clone(&args);
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, Arc::clone(&args)));
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
            Err(e) => {
                eprintln!("Mock board: accept error: {}", e);
            }
        }
    }
}

fn full(body: impl Into<Bytes>) -> MockBody {
    Full::new(body.into()).boxed_unsync()
}

fn respond(status: StatusCode, content_type: &str, body: MockBody) -> Response<MockBody> {
    Response::builder()
        .status(status)
        .header("content-type", content_type)
        .body(body)
        .expect("valid response")
}

async fn handle(req: Request<Incoming>, args: Arc<Args>) -> Result<Response<MockBody>, Infallible> {
    let response = match req.uri().path() {
        "/" => respond(
            StatusCode::OK,
            "text/plain",
            full(format!(
                "mock-board serving {}",
                args.logdir.as_deref().unwrap_or("")
            )),
        ),
        "/args" => respond(
            StatusCode::OK,
            "application/json",
            full(serde_json::to_vec(&args.raw).unwrap_or_default()),
        ),
        "/data/plugins_listing" => respond(
            StatusCode::OK,
            "application/json",
            full(r#"{"scalars":{"enabled":true}}"#),
        ),
        "/echo" => {
            let method = req.method().to_string();
            let path = req.uri().path().to_string();
            let query = req.uri().query().unwrap_or("").to_string();
            let headers: BTreeMap<String, String> = req
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect();
            let body = req
                .into_body()
                .collect()
                .await
                .map(|b| String::from_utf8_lossy(&b.to_bytes()).into_owned())
                .unwrap_or_default();

            let echoed = serde_json::json!({
                "method": method,
                "path": path,
                "query": query,
                "headers": headers,
                "body": body,
            });
            respond(StatusCode::OK, "application/json", full(echoed.to_string()))
        }
        "/stream" => {
            // Later chunks are held back long enough to tell streaming from buffering
            let chunks = futures::StreamExt::then(futures::stream::iter(0..3), |i| async move {
                let delay = if i == 0 { FIRST_CHUNK_DELAY } else { NEXT_CHUNK_DELAY };
                tokio::time::sleep(delay).await;
                Ok::<_, Infallible>(Frame::data(Bytes::from(format!("chunk-{}\n", i))))
            });
            respond(
                StatusCode::OK,
                "text/plain",
                StreamBody::new(chunks).boxed_unsync(),
            )
        }
        "/gzip" => {
            let mut response = respond(StatusCode::OK, "application/json", full(GZIP_BYTES));
            response
                .headers_mut()
                .insert("content-encoding", hyper::header::HeaderValue::from_static("gzip"));
            response
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", full("not found")),
    };

    Ok(response)
}
