use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::admin;
use crate::auth::require_admin_key;
use crate::handlers;
use crate::proto;
use crate::state::AppState;

/// Admin-gated write surface shared by both listeners.
fn control_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/api/v1/queue", post(admin::submit_queue))
        .route("/api/v1/control", post(admin::control))
        .route(
            "/api/v1/nodes/:name",
            get(admin::node_detail).delete(admin::node_delete),
        )
        .route("/api/v1/nodes/:name/pause", post(admin::node_pause))
        .route("/api/v1/nodes/:name/resume", post(admin::node_resume))
        .route("/api/v1/nodes/:name/ping", post(admin::node_ping))
        .route(
            "/api/v1/nodes/:name/reset-escalation",
            post(admin::node_reset_escalation),
        )
        .route("/api/v1/nodes/:name/set-type", post(admin::node_set_type))
        .route(
            "/api/v1/nodes/:name/config",
            get(admin::node_config_get).post(admin::node_config_set),
        )
        .route("/api/v1/ping", get(admin::ping_summary))
        .route("/api/v1/ping/all", get(admin::ping_all))
        .route("/api/v1/escalation", get(admin::escalation))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_key,
        ))
}

/// Public listener: unauthenticated reads plus the drone protocol; write
/// endpoints on this port still require the admin key.
pub fn public_app(state: AppState) -> Router {
    let open = Router::new()
        .route("/api/v1/health", get(handlers::health))
        .route("/api/v1/status", get(handlers::status))
        .route("/api/v1/nodes", get(handlers::nodes))
        .route("/api/v1/events", get(handlers::events))
        .route("/api/v1/events/history", get(handlers::events_history))
        .route("/api/v1/history", get(handlers::history))
        .route("/api/v1/sessions", get(handlers::sessions))
        .route("/api/v1/register", post(handlers::register))
        .route("/api/v1/work", get(handlers::work))
        .route("/api/v1/complete", post(handlers::complete));

    open.merge(control_routes(&state))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            proto::record_protocol,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            proto::enforce_deadline,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Admin listener: everything, all behind the key.
pub fn admin_app(state: AppState) -> Router {
    let admin_only = Router::new()
        .route(
            "/admin/api/payloads",
            get(admin::payloads_list).post(admin::payloads_register),
        )
        .route("/admin/api/payloads/status", get(admin::payloads_status))
        .route("/admin/api/payloads/:kind/versions", get(admin::payload_versions))
        .route(
            "/admin/api/payloads/:kind/verify",
            post(admin::payload_verify),
        )
        .route(
            "/admin/api/payloads/:kind/:version/deploy",
            post(admin::payload_deploy),
        )
        .route(
            "/admin/api/payloads/:kind/:version/rolling-deploy",
            post(admin::payload_rolling_deploy),
        )
        .route(
            "/admin/api/releases",
            get(admin::releases_list).post(admin::release_create),
        )
        .route("/admin/api/releases/rollback", post(admin::releases_rollback))
        .route("/admin/api/releases/diff", get(admin::releases_diff))
        .route(
            "/admin/api/releases/:version",
            get(admin::release_get).delete(admin::release_delete),
        )
        .route(
            "/admin/api/releases/:version/promote",
            post(admin::release_promote),
        )
        .route(
            "/admin/api/releases/:version/archive",
            post(admin::release_archive),
        )
        .route(
            "/admin/api/releases/:version/packages",
            get(admin::release_packages),
        )
        .route("/admin/api/logs/control-plane", get(admin::control_plane_log))
        .route("/admin/api/drones/:name/syslog", get(admin::drone_syslog))
        .route("/api/v1/sql/tables", get(admin::sql_tables))
        .route("/api/v1/sql/schema", get(admin::sql_schema))
        .route("/api/v1/sql/query", get(admin::sql_query))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_key,
        ));

    let reads = Router::new()
        .route("/api/v1/health", get(handlers::health))
        .route("/api/v1/status", get(handlers::status))
        .route("/api/v1/nodes", get(handlers::nodes))
        .route("/api/v1/events", get(handlers::events))
        .route("/api/v1/events/history", get(handlers::events_history))
        .route("/api/v1/history", get(handlers::history))
        .route("/api/v1/sessions", get(handlers::sessions));

    admin_only
        .merge(reads.route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_key,
        )))
        .merge(control_routes(&state))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            proto::record_protocol,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            proto::enforce_deadline,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use hive_bus::{EventBus, ProtocolRecorder};
    use hive_config::Settings;
    use hive_link::ScriptedLink;
    use hive_store::Store;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::util::ServiceExt;

    const TEST_KEY: &str = "test-admin-key";

    fn test_state() -> AppState {
        let store = Store::open_in_memory().unwrap();
        let (bus, _rx) = EventBus::new();
        let (recorder, _rx2) = ProtocolRecorder::new();
        let mut settings = Settings::default();
        settings.admin_key = TEST_KEY.to_string();
        let dir = std::env::temp_dir().join(format!("hive-api-test-{}", uuid::Uuid::new_v4()));
        settings.payload_dir = dir.join("payloads");
        settings.release_dir = dir.join("releases");
        AppState::build(
            store,
            bus,
            recorder,
            Arc::new(ScriptedLink::healthy()),
            settings,
        )
    }

    fn public() -> Router {
        public_app(test_state())
    }

    async fn send(app: &Router, method: Method, uri: &str, key: bool, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if key {
            builder = builder.header("X-Admin-Key", TEST_KEY);
        }
        let request = match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(value.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn open_reads_need_no_key() {
        let app = public();
        let (status, body) = send(&app, Method::GET, "/api/v1/health", false, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        let (status, _) = send(&app, Method::GET, "/api/v1/status", false, None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn public_writes_require_the_key() {
        let app = public();
        let body = json!({ "packages": ["a/b"], "session_name": "t" });
        let (status, _) =
            send(&app, Method::POST, "/api/v1/queue", false, Some(body.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = send(&app, Method::POST, "/api/v1/queue", true, Some(body)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn admin_listener_rejects_wrong_key() {
        let app = admin_app(test_state());
        let request = Request::builder()
            .uri("/api/v1/status")
            .header("X-Admin-Key", "wrong")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        for uri in [
            "/admin/api/payloads",
            "/admin/api/releases",
            "/api/v1/sql/tables",
            "/admin/api/logs/control-plane",
        ] {
            let (status, _) = send(&app, Method::GET, uri, false, None).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "open door at {}", uri);
        }
    }

    #[tokio::test]
    async fn drone_protocol_round_trip() {
        let app = public();

        // register
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/register",
            false,
            Some(json!({
                "id": "d1", "name": "alpha", "ip": "10.0.0.7", "type": "drone",
                "capabilities": { "cores": 16, "ram_gb": 64.0, "auto_reboot": true },
                "metrics": { "cpu_percent": 3.0, "ram_percent": 20.0, "load_1m": 0.4 },
                "version": "0.4.0"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "registered");
        assert_eq!(body["paused"], false);

        // queue work (admin)
        let (status, _) = send(
            &app,
            Method::POST,
            "/api/v1/queue",
            true,
            Some(json!({ "packages": ["dev-libs/openssl-3.2.0"], "session_name": "t1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // pull work
        let (status, body) =
            send(&app, Method::GET, "/api/v1/work?id=d1&cores=16", false, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["package"], "dev-libs/openssl-3.2.0");

        // nothing else queued
        let (_, body) = send(&app, Method::GET, "/api/v1/work?id=d1&cores=16", false, None).await;
        assert_eq!(body["package"], Value::Null);

        // report success
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/complete",
            false,
            Some(json!({
                "id": "d1", "package": "dev-libs/openssl-3.2.0",
                "status": "success", "build_duration_s": 10.0
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        // session closed with totals
        let (_, sessions) = send(&app, Method::GET, "/api/v1/sessions", false, None).await;
        assert_eq!(sessions[0]["completed"], 1);
        assert_eq!(sessions[0]["total"], 1);
        assert_eq!(sessions[0]["status"], "completed");
    }

    #[tokio::test]
    async fn stale_completion_still_answers_ok() {
        let app = public();
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/complete",
            false,
            Some(json!({ "id": "ghost", "package": "a/b", "status": "failed" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn bad_enum_values_are_400_with_hint() {
        let app = public();
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/complete",
            false,
            Some(json!({ "id": "d1", "package": "a/b", "status": "exploded" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["hint"].as_str().unwrap().contains("success"));

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/v1/control",
            true,
            Some(json!({ "action": "self-destruct" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_drone_actions_are_404() {
        let app = public();
        let (status, _) =
            send(&app, Method::POST, "/api/v1/nodes/ghost/pause", true, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sql_explorer_is_select_only() {
        let app = admin_app(test_state());
        let (status, body) = send(
            &app,
            Method::GET,
            "/api/v1/sql/query?q=SELECT%20key%20FROM%20control_flags",
            true,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["columns"][0], "key");

        let (status, _) = send(
            &app,
            Method::GET,
            "/api/v1/sql/query?q=DELETE%20FROM%20queue",
            true,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn payload_lifecycle_over_http() {
        let app = admin_app(test_state());
        use base64::Engine as _;
        let data = base64::engine::general_purpose::STANDARD.encode(b"payload");

        let (status, body) = send(
            &app,
            Method::POST,
            "/admin/api/payloads",
            true,
            Some(json!({ "kind": "drone_binary", "version": "v1", "data": data })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], "v1");

        // duplicate is a conflict
        let (status, _) = send(
            &app,
            Method::POST,
            "/admin/api/payloads",
            true,
            Some(json!({ "kind": "drone_binary", "version": "v1", "data": "eA==" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(
            &app,
            Method::GET,
            "/admin/api/payloads/drone_binary/versions",
            true,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn release_lifecycle_over_http() {
        let app = admin_app(test_state());

        for version in ["1.0", "1.1"] {
            let (status, _) = send(
                &app,
                Method::POST,
                "/admin/api/releases",
                true,
                Some(json!({ "version": version, "name": version, "packages": ["a/b"] })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, body) = send(
            &app,
            Method::POST,
            "/admin/api/releases/1.0/promote",
            true,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "active");

        // promoting 1.1 archives 1.0
        send(&app, Method::POST, "/admin/api/releases/1.1/promote", true, None).await;
        let (_, body) = send(&app, Method::GET, "/admin/api/releases/1.0", true, None).await;
        assert_eq!(body["status"], "archived");

        // promote of unknown release is 404
        let (status, _) = send(
            &app,
            Method::POST,
            "/admin/api/releases/9.9/promote",
            true,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // rollback returns to 1.0
        let (status, body) =
            send(&app, Method::POST, "/admin/api/releases/rollback", true, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], "1.0");
    }

    #[tokio::test]
    async fn node_set_type_validates_kind() {
        let app = public();
        send(
            &app,
            Method::POST,
            "/api/v1/register",
            false,
            Some(json!({ "id": "d1", "name": "alpha", "ip": "10.0.0.7" })),
        )
        .await;

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/v1/nodes/alpha/set-type",
            true,
            Some(json!({ "drone_type": "mainframe" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/nodes/alpha/set-type",
            true,
            Some(json!({ "drone_type": "bare-metal" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["drone_type"], "bare-metal");
    }
}
