use crate::journal::catalog::{FactorBook, ModelBook};
use crate::journal::{live_session_stats, test_session_stats};
use crate::state::{AppState, JournalCommand, JournalSnapshot};
use crate::stats::aggregate::{self, compare_stats, sort_stats, StatsOrder};
use axum::extract::{Query, State};
use axum::response::Json;
use std::sync::Arc;

#[derive(serde::Deserialize)]
pub struct StatsQuery {
    /// Session to aggregate. Defaults to the current one.
    pub session: Option<String>,
    #[serde(default)]
    pub order: StatsOrder,
}

fn error(e: impl std::fmt::Display) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "error": e.to_string() }))
}

/// GET /api/state -- current journal snapshot (from watch channel, no lock)
pub async fn get_state(State(state): State<Arc<AppState>>) -> Json<JournalSnapshot> {
    let snapshot = state.snapshot_rx.borrow().clone();
    Json(snapshot)
}

/// GET /api/stats/test -- per-model stats for a test session
pub async fn get_test_stats(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsQuery>,
) -> Json<serde_json::Value> {
    let snapshot = state.snapshot_rx.borrow().clone();
    let id = params.session.or(snapshot.test.current_id);
    let Some(session) = id.and_then(|id| snapshot.test.sessions.into_iter().find(|s| s.id == id)) else {
        return error("no test session");
    };
    let factors = FactorBook::from_factors(snapshot.factors);
    let mut stats = test_session_stats(&session, &factors);
    sort_stats(&mut stats, params.order);
    Json(serde_json::json!({
        "session_id": session.id,
        "measurement_mode": session.measurement_mode,
        "summary": aggregate::summarize(&session.trades, session.measurement_mode),
        "stats": stats,
    }))
}

/// GET /api/stats/live -- per-model stats for the current or an archived live session
pub async fn get_live_stats(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsQuery>,
) -> Json<serde_json::Value> {
    let snapshot = state.snapshot_rx.borrow().clone();
    let mut sessions = snapshot.live.current.into_iter().chain(snapshot.live.history);
    let session = match &params.session {
        Some(id) => sessions.find(|s| &s.id == id),
        None => sessions.next(),
    };
    let Some(session) = session else {
        return error("no live session");
    };
    let models = ModelBook::from_models(snapshot.models);
    let mut stats = live_session_stats(&session, &models);
    sort_stats(&mut stats, params.order);
    Json(serde_json::json!({
        "session_id": session.id,
        "measurement_mode": session.measurement_mode,
        "summary": aggregate::summarize(&session.trades, session.measurement_mode),
        "stats": stats,
    }))
}

/// GET /api/stats/simulation -- running stats, or an archived run's when `session` is given
pub async fn get_simulation_stats(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsQuery>,
) -> Json<serde_json::Value> {
    let session = params.session;
    let mut rows = match state.simulation_stats(session.clone()).await {
        Ok(rows) => rows,
        Err(e) => return error(e),
    };
    rows.sort_by(|a, b| compare_stats(&a.stats, &b.stats, params.order));
    let simulation = state.snapshot_rx.borrow().simulation.clone();
    let summary = session.as_deref().and_then(|id| simulation.history.iter().find(|s| s.id == id)).cloned();
    Json(serde_json::json!({
        "session_id": session.or(simulation.session_id.clone()),
        "state": simulation.state,
        "current_iteration": simulation.current_iteration,
        "iteration_count": simulation.iteration_count,
        "session": summary,
        "stats": rows,
    }))
}

/// GET /api/counters -- performance counters (lock-free reads)
pub async fn get_counters(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    use portable_atomic::Ordering::Relaxed;
    Json(serde_json::json!({
        "commands_applied": state.counters.commands_applied.load(Relaxed),
        "commands_rejected": state.counters.commands_rejected.load(Relaxed),
        "iterations_recorded": state.counters.iterations_recorded.load(Relaxed),
        "stale_ticks_dropped": state.counters.stale_ticks_dropped.load(Relaxed),
        "saves_queued": state.counters.saves_queued.load(Relaxed),
        "ws_messages_sent": state.counters.ws_messages_sent.load(Relaxed),
    }))
}

/// POST /api/command -- apply one journal command, reply with the fresh snapshot
pub async fn post_command(
    State(state): State<Arc<AppState>>,
    Json(cmd): Json<JournalCommand>,
) -> Json<serde_json::Value> {
    if let Err(e) = state.submit(cmd).await {
        return error(e);
    }
    let snapshot = state.snapshot_rx.borrow().clone();
    Json(serde_json::json!(snapshot))
}
