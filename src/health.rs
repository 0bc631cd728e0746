//! Liveness endpoint.
//!
//! A minimal HTTP/1.1 server answering `GET /health` with
//! `{"status": "ok"}`.  It reads no reconciliation state and stops when the
//! shared cancellation token fires.

use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Bind `bind_addr` and serve until cancelled.
pub async fn run_health_server(
    bind_addr: SocketAddr,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!("Health endpoint listening on {}", bind_addr);
    serve(listener, cancel).await
}

async fn serve(listener: TcpListener, cancel: CancellationToken) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Health endpoint shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        if let Err(e) = http1::Builder::new()
                            .serve_connection(io, service_fn(handle))
                            .await
                        {
                            debug!("Health connection from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => error!("Failed to accept health connection: {}", e),
            },
        }
    }
    Ok(())
}

async fn handle(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    debug!("Health request: {} {}", req.method(), req.uri().path());
    Ok(route(req.method(), req.uri().path()))
}

fn route(method: &Method, path: &str) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/health") => json_response(StatusCode::OK, r#"{"status": "ok"}"#),
        _ => json_response(StatusCode::NOT_FOUND, r#"{"status": "not_found"}"#),
    }
}

fn json_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
