use axum::extract::{Path, Query, State};
use axum::Json;
use base64::Engine as _;
use chrono::Utc;
use hive_domain::{
    ControlAction, DroneConfig, DroneKind, Event, EventKind, PayloadKind,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::ApiError;
use crate::handlers::{drone_by_name_or_id, drone_json};
use crate::state::AppState;

// ── Queue & control ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct QueueBody {
    pub packages: Vec<String>,
    #[serde(default)]
    pub session_name: Option<String>,
}

pub async fn submit_queue(
    State(state): State<AppState>,
    Json(body): Json<QueueBody>,
) -> Result<Json<Value>, ApiError> {
    if body.packages.is_empty() {
        return Err(ApiError::bad_request("packages must not be empty")
            .with_hint("send {\"packages\": [\"category/name\"], \"session_name\": \"...\"}"));
    }
    let now = Utc::now();
    let name = body
        .session_name
        .unwrap_or_else(|| format!("batch-{}", now.format("%Y%m%d-%H%M%S")));
    let session = state.store.create_session(&name, now)?;
    let submitted = state
        .store
        .submit_packages(&body.packages, Some(session.id), now)?;
    state.store.refresh_session(session.id, now)?;

    info!(session = %name, submitted, "queue submission");
    state.bus.publish(
        Event::new(
            EventKind::QueueSubmitted,
            format!("{} package(s) submitted in session {}", submitted, name),
        )
        .with_details(json!({ "session_id": session.id, "count": submitted })),
    );
    Ok(Json(json!({
        "session_id": session.id,
        "session_name": name,
        "submitted": submitted,
        "skipped": body.packages.len() as u32 - submitted,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ControlBody {
    pub action: String,
}

pub async fn control(
    State(state): State<AppState>,
    Json(body): Json<ControlBody>,
) -> Result<Json<Value>, ApiError> {
    let action = ControlAction::parse(&body.action).map_err(|e| {
        ApiError::bad_request(e.to_string()).with_hint(
            "one of: pause, resume, unblock, unground, reset, rebalance, clear_failures, retry_failures",
        )
    })?;
    Ok(Json(state.scheduler.control(action, Utc::now())?))
}

// ── Drones ────────────────────────────────────────────────────────────────────

fn require_drone(state: &AppState, name: &str) -> Result<hive_domain::Drone, ApiError> {
    drone_by_name_or_id(&state.store, name)?
        .ok_or_else(|| ApiError::not_found(format!("drone '{}' not found", name)))
}

pub async fn node_detail(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let drone = require_drone(&state, &name)?;
    let mut row = drone_json(&state, &drone)?;
    if let Some(config) = state.store.get_drone_config(&drone.name)? {
        // secrets stay out of responses
        row["config"] = json!({
            "ssh_user": config.ssh_user,
            "ssh_port": config.ssh_port,
            "core_limit": config.core_limit,
            "job_count": config.job_count,
            "mem_cap_gb": config.mem_cap_gb,
            "auto_reboot": config.auto_reboot,
            "protected": config.protected,
            "max_failures": config.max_failures,
            "binhost_target": config.binhost_target,
            "display_name": config.display_name,
            "control_tag": config.control_tag,
            "locked": config.locked,
            "notes": config.notes,
        });
    }
    Ok(Json(row))
}

pub async fn node_delete(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let drone = require_drone(&state, &name)?;
    state.store.delete_drone(&drone.id)?;
    state.bus.publish(
        Event::new(EventKind::Control, format!("drone {} deleted by admin", drone.name))
            .with_drone(&drone.id),
    );
    Ok(Json(json!({ "deleted": drone.name })))
}

async fn set_paused(state: &AppState, name: &str, paused: bool) -> Result<Json<Value>, ApiError> {
    let drone = require_drone(state, name)?;
    state.store.set_drone_paused(&drone.id, paused)?;
    state.bus.publish(
        Event::new(
            EventKind::Control,
            format!("{} {}", drone.name, if paused { "paused" } else { "resumed" }),
        )
        .with_drone(&drone.id),
    );
    Ok(Json(json!({ "drone": drone.name, "paused": paused })))
}

pub async fn node_pause(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    set_paused(&state, &name, true).await
}

pub async fn node_resume(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    set_paused(&state, &name, false).await
}

pub async fn node_ping(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let drone = require_drone(&state, &name)?;
    let probe = state.healer.ping(&drone, Utc::now()).await?;
    Ok(Json(json!({ "drone": drone.name, "probe": probe })))
}

pub async fn node_reset_escalation(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let drone = require_drone(&state, &name)?;
    state.healer.reset(&drone.id)?;
    state.bus.publish(
        Event::new(
            EventKind::Control,
            format!("escalation reset for {}", drone.name),
        )
        .with_drone(&drone.id),
    );
    Ok(Json(json!({ "drone": drone.name, "escalation_level": 0 })))
}

#[derive(Debug, Deserialize)]
pub struct SetTypeBody {
    pub drone_type: String,
}

pub async fn node_set_type(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<SetTypeBody>,
) -> Result<Json<Value>, ApiError> {
    let kind = DroneKind::parse(&body.drone_type).map_err(|e| {
        ApiError::bad_request(e.to_string())
            .with_hint("one of: container, vm, bare-metal, unknown")
    })?;
    let drone = require_drone(&state, &name)?;
    state.store.set_drone_kind(&drone.id, kind)?;
    // in-flight recovery actions finish; the new kind applies from the next
    // self-heal evaluation
    state.bus.publish(
        Event::new(
            EventKind::Control,
            format!("{} type set to {}", drone.name, kind),
        )
        .with_drone(&drone.id),
    );
    Ok(Json(json!({ "drone": drone.name, "drone_type": kind })))
}

pub async fn node_config_get(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let drone = require_drone(&state, &name)?;
    let config = state
        .store
        .get_drone_config(&drone.name)?
        .unwrap_or_else(|| DroneConfig::new(&drone.name));
    Ok(Json(json!(config)))
}

pub async fn node_config_set(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(mut config): Json<DroneConfig>,
) -> Result<Json<Value>, ApiError> {
    let drone = require_drone(&state, &name)?;
    config.name = drone.name.clone();
    state.store.upsert_drone_config(&config)?;
    Ok(Json(json!({ "drone": drone.name, "updated": true })))
}

// ── Self-healing ──────────────────────────────────────────────────────────────

/// Last known probe round trips, no new traffic.
pub async fn ping_summary(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let rows: Vec<Value> = state
        .store
        .list_drones()?
        .iter()
        .map(|d| {
            json!({
                "drone": d.name,
                "last_ping_sent": d.last_ping_sent.map(hive_domain::utc_to_epoch),
                "last_ping_received": d.last_ping_received.map(hive_domain::utc_to_epoch),
                "last_rtt_ms": d.last_rtt_ms,
            })
        })
        .collect();
    Ok(Json(json!(rows)))
}

/// Probe every drone right now, sequentially.
pub async fn ping_all(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let now = Utc::now();
    let mut results = serde_json::Map::new();
    for drone in state.store.list_drones()? {
        let probe = state.healer.ping(&drone, now).await?;
        results.insert(drone.name, json!(probe));
    }
    Ok(Json(Value::Object(results)))
}

pub async fn escalation(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.store.list_health()?)))
}

// ── Payloads ──────────────────────────────────────────────────────────────────

fn parse_payload_kind(kind: &str) -> Result<PayloadKind, ApiError> {
    PayloadKind::parse(kind).map_err(|e| {
        ApiError::bad_request(e.to_string())
            .with_hint("one of: drone_binary, init_script, config")
    })
}

pub async fn payloads_list(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.store.list_payloads()?)))
}

#[derive(Debug, Deserialize)]
pub struct PayloadBody {
    pub kind: String,
    pub version: String,
    /// Payload bytes, base64.
    pub data: String,
    #[serde(default)]
    pub notes: Option<String>,
}

pub async fn payloads_register(
    State(state): State<AppState>,
    Json(body): Json<PayloadBody>,
) -> Result<Json<Value>, ApiError> {
    let kind = parse_payload_kind(&body.kind)?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&body.data)
        .map_err(|e| ApiError::bad_request(format!("data is not valid base64: {}", e)))?;
    let payload = state
        .registry
        .register(kind, &body.version, &bytes, body.notes.as_deref(), Utc::now())
        .await?;
    Ok(Json(json!(payload)))
}

pub async fn payloads_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!({
        "deployments": state.store.list_drone_payloads()?,
        "log": state.store.list_deploy_log(50)?,
    })))
}

pub async fn payload_versions(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let kind = parse_payload_kind(&kind)?;
    Ok(Json(json!(state.store.list_payload_versions(kind)?)))
}

#[derive(Debug, Deserialize)]
pub struct DeployBody {
    pub drone: String,
    #[serde(default)]
    pub verify: Option<bool>,
    #[serde(default)]
    pub deployed_by: Option<String>,
}

pub async fn payload_deploy(
    State(state): State<AppState>,
    Path((kind, version)): Path<(String, String)>,
    Json(body): Json<DeployBody>,
) -> Result<Json<Value>, ApiError> {
    let kind = parse_payload_kind(&kind)?;
    let result = state
        .deployer
        .deploy(
            kind,
            &version,
            &body.drone,
            body.verify.unwrap_or(true),
            Utc::now(),
        )
        .await?;
    Ok(Json(json!({
        "drone": body.drone,
        "deployed_by": body.deployed_by,
        "result": result,
    })))
}

#[derive(Debug, Deserialize)]
pub struct RollingBody {
    #[serde(default)]
    pub drones: Option<Vec<String>>,
    #[serde(default)]
    pub health_check: Option<bool>,
    #[serde(default)]
    pub rollback_on_fail: Option<bool>,
}

pub async fn payload_rolling_deploy(
    State(state): State<AppState>,
    Path((kind, version)): Path<(String, String)>,
    Json(body): Json<RollingBody>,
) -> Result<Json<Value>, ApiError> {
    let kind = parse_payload_kind(&kind)?;
    let outcome = state
        .deployer
        .rolling(
            kind,
            &version,
            body.drones,
            body.health_check.unwrap_or(false),
            body.rollback_on_fail.unwrap_or(false),
            Utc::now(),
        )
        .await?;
    Ok(Json(json!(outcome)))
}

#[derive(Debug, Deserialize)]
pub struct VerifyBody {
    pub drone: String,
}

pub async fn payload_verify(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(body): Json<VerifyBody>,
) -> Result<Json<Value>, ApiError> {
    let kind = parse_payload_kind(&kind)?;
    let outcome = state.deployer.verify(kind, &body.drone, Utc::now()).await?;
    Ok(Json(json!(outcome)))
}

// ── Releases ──────────────────────────────────────────────────────────────────

pub async fn releases_list(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.store.list_releases()?)))
}

#[derive(Debug, Deserialize)]
pub struct ReleaseBody {
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub packages: Vec<String>,
}

pub async fn release_create(
    State(state): State<AppState>,
    Json(body): Json<ReleaseBody>,
) -> Result<Json<Value>, ApiError> {
    let release = state
        .releases
        .create(&body.version, &body.name, &body.packages, Utc::now())
        .await?;
    Ok(Json(json!(release)))
}

pub async fn release_get(
    State(state): State<AppState>,
    Path(version): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let release = state
        .store
        .get_release(&version)?
        .ok_or_else(|| ApiError::not_found(format!("release '{}' not found", version)))?;
    Ok(Json(json!(release)))
}

pub async fn release_delete(
    State(state): State<AppState>,
    Path(version): Path<String>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.releases.delete(&version, Utc::now()).await?)))
}

pub async fn release_promote(
    State(state): State<AppState>,
    Path(version): Path<String>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.releases.promote(&version, Utc::now())?)))
}

pub async fn release_archive(
    State(state): State<AppState>,
    Path(version): Path<String>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.releases.archive(&version, Utc::now())?)))
}

pub async fn releases_rollback(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    match state.releases.rollback(Utc::now())? {
        Some(release) => Ok(Json(json!(release))),
        None => Err(ApiError::not_found("no archived release to roll back to")),
    }
}

#[derive(Debug, Deserialize)]
pub struct DiffQuery {
    pub from: String,
    pub to: String,
}

pub async fn releases_diff(
    State(state): State<AppState>,
    Query(q): Query<DiffQuery>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.releases.diff(&q.from, &q.to)?)))
}

pub async fn release_packages(
    State(state): State<AppState>,
    Path(version): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.store.get_release(&version)?.is_none() {
        return Err(ApiError::not_found(format!("release '{}' not found", version)));
    }
    Ok(Json(json!(state.store.release_packages(&version)?)))
}

// ── Logs ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LinesQuery {
    pub lines: Option<usize>,
}

pub async fn control_plane_log(
    State(state): State<AppState>,
    Query(q): Query<LinesQuery>,
) -> Result<Json<Value>, ApiError> {
    let path = state.settings.log_path();
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| ApiError::not_found(format!("log file {}: {}", path.display(), e)))?;
    let lines: Vec<&str> = content.lines().collect();
    let n = q.lines.unwrap_or(200).min(5_000);
    let tail: Vec<String> = lines
        .iter()
        .rev()
        .take(n)
        .rev()
        .map(|s| s.to_string())
        .collect();
    Ok(Json(json!({ "path": path.display().to_string(), "lines": tail })))
}

pub async fn drone_syslog(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<LinesQuery>,
) -> Result<Json<Value>, ApiError> {
    let drone = require_drone(&state, &name)?;
    let config = state.store.get_drone_config(&drone.name)?;
    let target = hive_link::LinkTarget::resolve(&drone, config.as_ref());
    let n = q.lines.unwrap_or(200).min(5_000);
    let output = state
        .link
        .exec(
            &target,
            &format!("tail -n {} /var/log/messages 2>/dev/null || journalctl -n {}", n, n),
            state.settings.ssh_op_timeout(),
        )
        .await
        .map_err(|e| ApiError::internal(format!("syslog read failed: {}", e)))?;
    Ok(Json(json!({
        "drone": drone.name,
        "exit_code": output.exit_code,
        "lines": output.stdout.lines().collect::<Vec<_>>(),
    })))
}

// ── SQL explorer ──────────────────────────────────────────────────────────────

pub async fn sql_tables(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.store.explorer_tables()?)))
}

pub async fn sql_schema(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.store.explorer_schema()?))
}

#[derive(Debug, Deserialize)]
pub struct SqlQuery {
    pub q: String,
}

pub async fn sql_query(
    State(state): State<AppState>,
    Query(query): Query<SqlQuery>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.store.explorer_query(&query.q)?)))
}
