use axum::{
    extract::Request,
    http::{header, HeaderValue, Uri},
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::{info, info_span, Instrument};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Collapses runs of `/` in the path, keeping the query string. Must wrap the
/// router from outside, since route matching has already happened by the time
/// a `Router::layer` middleware runs.
pub async fn normalize_path(mut req: Request, next: Next) -> Response {
    let uri = req.uri();
    let path = uri.path();

    let mut normalized = path.to_string();
    while normalized.contains("//") {
        normalized = normalized.replace("//", "/");
    }

    if normalized != path {
        let mut parts = uri.clone().into_parts();
        let new_path_and_query = match uri.query() {
            Some(query) => format!("{}?{}", normalized, query),
            None => normalized,
        };

        if let Ok(new_uri) = new_path_and_query.parse::<Uri>() {
            parts.path_and_query = new_uri.into_parts().path_and_query;
            if let Ok(new_uri) = Uri::from_parts(parts) {
                *req.uri_mut() = new_uri;
            }
        }
    }

    next.run(req).await
}

/// Access log line per request. Everything logged while the request runs is
/// inside a span carrying a fresh request id, which is echoed back in
/// `x-request-id`.
pub async fn log_request(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let request_id = uuid::Uuid::new_v4();
    let start = Instant::now();

    let mut response = next
        .run(req)
        .instrument(info_span!("request", request_id = %request_id))
        .await;

    let status = response.status().as_u16();
    let content_length = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    info!(
        request_id = %request_id,
        method = %method,
        url = %uri,
        status = status,
        length = content_length,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "HTTP request"
    );

    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}
