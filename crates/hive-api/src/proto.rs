use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use hive_bus::classify;
use hive_domain::{DroneId, ProtocolEntry};
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::state::AppState;

/// Captured bytes per direction; anything longer is cut with a marker.
const CAPTURE_CAP: usize = 8 * 1024;

fn capture(bytes: &Bytes) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= CAPTURE_CAP {
        text.into_owned()
    } else {
        let mut cut = text
            .char_indices()
            .take_while(|(i, _)| *i < CAPTURE_CAP)
            .map(|(_, c)| c)
            .collect::<String>();
        cut.push_str("...[truncated]");
        cut
    }
}

/// Pull drone/package hints out of a JSON request body or the query string.
fn hints(body: &str, query: Option<&str>) -> (Option<DroneId>, Option<String>) {
    let mut drone = None;
    let mut package = None;
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        drone = value
            .get("id")
            .and_then(|v| v.as_str())
            .map(DroneId::new);
        package = value
            .get("package")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
    }
    if drone.is_none() {
        if let Some(query) = query {
            drone = query
                .split('&')
                .find_map(|kv| kv.strip_prefix("id="))
                .map(DroneId::new);
        }
    }
    (drone, package)
}

/// Synthesize one protocol entry per completed exchange and queue it to the
/// background writer. Bodies are buffered (request bodies here are small
/// JSON) and re-injected untouched.
pub async fn record_protocol(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(|q| q.to_string());
    let source = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("local")
        .to_string();

    let (parts, body) = request.into_parts();
    let request_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();
    let request_body = capture(&request_bytes);
    let request = Request::from_parts(parts, Body::from(request_bytes));

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let (parts, body) = response.into_parts();
    let response_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();
    let response_body = capture(&response_bytes);
    let response = Response::from_parts(parts, Body::from(response_bytes));

    let (drone, package) = hints(&request_body, query.as_deref());
    state.recorder.record(ProtocolEntry {
        ts: Utc::now(),
        source,
        method: method.clone(),
        path: path.clone(),
        tag: classify(&method, &path).to_string(),
        status,
        latency_ms: started.elapsed().as_secs_f64() * 1000.0,
        drone,
        package,
        request_body,
        response_body,
    });

    response
}

/// Per-request deadline; expiry answers 504.
pub async fn enforce_deadline(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    match tokio::time::timeout(state.settings.request_deadline(), next.run(request)).await {
        Ok(response) => response,
        Err(_) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({ "error": "request deadline exceeded" })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_truncates_with_marker() {
        let big = Bytes::from(vec![b'a'; CAPTURE_CAP + 100]);
        let captured = capture(&big);
        assert!(captured.ends_with("...[truncated]"));
        assert!(captured.len() < CAPTURE_CAP + 32);
        let small = Bytes::from_static(b"{}");
        assert_eq!(capture(&small), "{}");
    }

    #[test]
    fn hints_come_from_body_then_query() {
        let (drone, package) =
            hints(r#"{"id":"d1","package":"app-misc/jq"}"#, None);
        assert_eq!(drone.unwrap().as_str(), "d1");
        assert_eq!(package.unwrap(), "app-misc/jq");

        let (drone, package) = hints("", Some("id=d2&cores=8"));
        assert_eq!(drone.unwrap().as_str(), "d2");
        assert!(package.is_none());
    }
}
