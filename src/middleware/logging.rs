//! HTTP request instrumentation.
//!
//! Every API call runs inside a request span and lands one structured line
//! plus a latency histogram sample when the response goes out. Health
//! probes stay out of the log stream.

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{info, warn, Instrument};

pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();

    if path == "/api/health" {
        return next.run(request).await;
    }

    let span = tracing::info_span!("api_request", %method, %path);
    let started = Instant::now();
    let response = next.run(request).instrument(span).await;
    let elapsed = started.elapsed();

    metrics::histogram!("http_request_seconds", elapsed.as_secs_f64());

    let status = response.status();
    if status.is_server_error() {
        warn!(
            %method,
            %path,
            status = status.as_u16(),
            elapsed_us = elapsed.as_micros() as u64,
            "request errored"
        );
    } else {
        info!(
            %method,
            %path,
            status = status.as_u16(),
            elapsed_us = elapsed.as_micros() as u64,
            "request handled"
        );
    }

    response
}
