use axum::extract::{Query, State};
use axum::Json;
use chrono::Utc;
use hive_domain::{
    epoch_to_utc, utc_to_epoch, AssignResult, Capabilities, CompletionReport, CompletionStatus,
    Drone, DroneId, DroneRole, EventKind, Metrics, Registration,
};
use hive_store::Store;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;

pub(crate) fn drone_by_name_or_id(
    store: &Store,
    needle: &str,
) -> Result<Option<Drone>, hive_store::StoreError> {
    if let Some(drone) = store.get_drone_by_name(needle)? {
        return Ok(Some(drone));
    }
    store.get_drone(&DroneId::new(needle))
}

pub(crate) fn drone_json(state: &AppState, drone: &Drone) -> Result<Value, ApiError> {
    let now = Utc::now();
    let health = state.store.get_health(&drone.id)?;
    Ok(json!({
        "id": drone.id,
        "name": drone.name,
        "ip": drone.ip,
        "type": drone.role,
        "drone_type": drone.kind,
        "capabilities": drone.capabilities,
        "metrics": drone.metrics,
        "paused": drone.paused,
        "current_task": drone.current_task,
        "version": drone.version,
        "registered_at": utc_to_epoch(drone.registered_at),
        "last_seen": utc_to_epoch(drone.last_seen),
        "last_ping_sent": drone.last_ping_sent.map(utc_to_epoch),
        "last_ping_received": drone.last_ping_received.map(utc_to_epoch),
        "last_rtt_ms": drone.last_rtt_ms,
        "online": drone.is_online(now, chrono::Duration::seconds(
            state.settings.reclaim_offline_minutes as i64 * 60)),
        "grounded": health.is_grounded(now),
        "failures": health.failures,
        "escalation_level": health.escalation_level,
    }))
}

// ── Drone protocol ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    pub id: String,
    pub name: String,
    pub ip: String,
    #[serde(rename = "type", default)]
    pub role: DroneRole,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> Result<Json<Value>, ApiError> {
    let reg = Registration {
        id: DroneId::new(&body.id),
        name: body.name,
        ip: body.ip,
        role: body.role,
        capabilities: body.capabilities,
        metrics: body.metrics,
        current_task: body.current_task,
        version: body.version,
    };
    let drone = state.scheduler.register(&reg, Utc::now())?;
    Ok(Json(json!({
        "status": "registered",
        "orchestrator": state.settings.orchestrator_name,
        "orchestrator_port": state.settings.public_port,
        "orchestrator_name": state.settings.orchestrator_name,
        "paused": drone.paused,
    })))
}

#[derive(Debug, Deserialize)]
pub struct WorkQuery {
    pub id: String,
    #[allow(dead_code)]
    pub cores: Option<u32>,
}

pub async fn work(
    State(state): State<AppState>,
    Query(q): Query<WorkQuery>,
) -> Result<Json<Value>, ApiError> {
    let result = state
        .scheduler
        .request_work(&DroneId::new(&q.id), Utc::now())?;
    let package = match result {
        AssignResult::Assigned(item) => Some(item.package),
        AssignResult::Empty => None,
        AssignResult::Rejected(reason) => {
            debug!(drone = %q.id, %reason, "work request rejected");
            None
        }
    };
    Ok(Json(json!({ "package": package })))
}

#[derive(Debug, Deserialize)]
pub struct CompleteBody {
    pub id: String,
    pub package: String,
    pub status: String,
    #[serde(default)]
    pub build_duration_s: Option<f64>,
    #[serde(default)]
    pub error_detail: Option<String>,
}

pub async fn complete(
    State(state): State<AppState>,
    Json(body): Json<CompleteBody>,
) -> Result<Json<Value>, ApiError> {
    let status = CompletionStatus::parse(&body.status)
        .map_err(|e| ApiError::bad_request(e.to_string()).with_hint("status is one of success, failed, returned"))?;
    let report = CompletionReport {
        drone: DroneId::new(&body.id),
        package: body.package.clone(),
        status,
        duration_s: body.build_duration_s.unwrap_or(0.0),
        error: body.error_detail,
    };
    // Stale and duplicate reports are dropped internally; the drone always
    // gets an ok so its retry loop settles.
    state.scheduler.complete(&report, Utc::now())?;
    Ok(Json(json!({ "status": "ok", "package": body.package })))
}

// ── Read-only endpoints ───────────────────────────────────────────────────────

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let now = Utc::now();
    let drones = state.store.list_drones()?;
    let online = drones
        .iter()
        .filter(|d| {
            d.is_online(
                now,
                chrono::Duration::seconds(state.settings.reclaim_offline_minutes as i64 * 60),
            )
        })
        .count();
    let counts = state.store.queue_counts()?;
    let sessions = state.store.list_sessions()?;
    let active_sessions = sessions
        .iter()
        .filter(|s| s.status == hive_domain::SessionStatus::Active)
        .count();

    Ok(Json(json!({
        "orchestrator": state.settings.orchestrator_name,
        "uptime_s": (now - state.started_at).num_seconds(),
        "queue": counts,
        "queue_paused": state.store.queue_paused()?,
        "drones": { "total": drones.len(), "online": online },
        "sessions": { "total": sessions.len(), "active": active_sessions },
        "events_dropped": state.bus.dropped(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct NodesQuery {
    #[serde(default)]
    pub all: Option<bool>,
}

pub async fn nodes(
    State(state): State<AppState>,
    Query(q): Query<NodesQuery>,
) -> Result<Json<Value>, ApiError> {
    let now = Utc::now();
    let offline_after =
        chrono::Duration::seconds(state.settings.reclaim_offline_minutes as i64 * 60);
    let mut rows = Vec::new();
    for drone in state.store.list_drones()? {
        if !q.all.unwrap_or(false) && !drone.is_online(now, offline_after) {
            continue;
        }
        rows.push(drone_json(&state, &drone)?);
    }
    Ok(Json(json!(rows)))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<u32>,
    /// Epoch seconds; only events after this instant.
    pub since: Option<f64>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub drone: Option<String>,
}

fn parse_kind(kind: &Option<String>) -> Result<Option<EventKind>, ApiError> {
    kind.as_deref()
        .map(|s| {
            EventKind::parse(s)
                .map_err(|e| ApiError::bad_request(e.to_string()).with_hint("see event kinds in /api/v1/events"))
        })
        .transpose()
}

/// Recent tail from the in-memory ring.
pub async fn events(
    State(state): State<AppState>,
    Query(q): Query<EventsQuery>,
) -> Result<Json<Value>, ApiError> {
    let kind = parse_kind(&q.kind)?;
    let events = state.bus.recent(
        q.limit.unwrap_or(100) as usize,
        q.since.map(epoch_to_utc),
        kind,
    );
    Ok(Json(json!(events)))
}

/// Persistent event history from the store.
pub async fn events_history(
    State(state): State<AppState>,
    Query(q): Query<EventsQuery>,
) -> Result<Json<Value>, ApiError> {
    let kind = parse_kind(&q.kind)?;
    let drone = match &q.drone {
        Some(needle) => drone_by_name_or_id(&state.store, needle)?.map(|d| d.id),
        None => None,
    };
    let events = state.store.list_events(
        q.limit.unwrap_or(100),
        q.since.map(epoch_to_utc),
        kind,
        drone.as_ref(),
    )?;
    Ok(Json(json!(events)))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
    pub status: Option<String>,
    pub drone: Option<String>,
}

pub async fn history(
    State(state): State<AppState>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = q
        .status
        .as_deref()
        .map(CompletionStatus::parse)
        .transpose()?;
    let drone = match &q.drone {
        Some(needle) => drone_by_name_or_id(&state.store, needle)?.map(|d| d.id),
        None => None,
    };
    let records = state
        .store
        .list_history(q.limit.unwrap_or(100), status, drone.as_ref())?;
    Ok(Json(json!(records)))
}

pub async fn sessions(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.store.list_sessions()?)))
}
