use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{Encoder, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Spawns the HTTP server exposing Prometheus metrics and liveness.
pub fn spawn_http_server(addr: SocketAddr, shutdown: CancellationToken) {
    info!(%addr, "starting metrics endpoint");

    tokio::spawn(async move {
        let shutdown_for_service = shutdown.clone();
        let make_svc = make_service_fn(move |_conn| {
            let shutdown = shutdown_for_service.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    handle_request(req, shutdown.clone())
                }))
            }
        });

        let server = Server::bind(&addr).serve(make_svc);
        let server = server.with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        });

        if let Err(err) = server.await {
            error!(%addr, error = %err, "metrics server exited unexpectedly");
        } else {
            info!(%addr, "metrics server stopped");
        }
    });
}

async fn handle_request(
    req: Request<Body>,
    shutdown: CancellationToken,
) -> Result<Response<Body>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") | (&Method::HEAD, "/metrics") => {
            let encoder = TextEncoder::new();
            let metric_families = prometheus::gather();
            let mut buffer = Vec::new();

            if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
                warn!(error = %err, "failed to encode metrics payload");
                let response = Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::from("failed to encode metrics"))
                    .expect("failed to build metrics error response");
                return Ok(response);
            }

            let response = Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, encoder.format_type())
                .body(Body::from(buffer))
                .expect("failed to build metrics response");
            Ok(response)
        }
        (&Method::GET, "/healthz") | (&Method::HEAD, "/healthz") => {
            let (status, body) = if shutdown.is_cancelled() {
                (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
            } else {
                (StatusCode::OK, "ok")
            };

            let response = Response::builder()
                .status(status)
                .body(Body::from(body))
                .expect("failed to build health response");
            Ok(response)
        }
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("not found"))
            .expect("failed to build 404 response")),
    }
}
