mod config;
mod db;
mod errors;
mod journal;
mod server;
mod simulation;
mod state;
mod stats;

use crate::journal::{Applied, Journal};
use crate::simulation::runner::TickReport;
use crate::simulation::scheduler::IntervalScheduler;
use crate::state::*;
use chrono::{DateTime, Utc};
use portable_atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type LiveJournal = Journal<IntervalScheduler>;

#[tokio::main]
async fn main() {
    // Structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("factor_journal starting");

    // Load config
    let cfg = match config::AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("config error: {e}");
            std::process::exit(1);
        }
    };

    // Init database and read back persisted sections
    let db_pool = match db::init_db(&cfg.data_dir) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!("database init error: {e}");
            std::process::exit(1);
        }
    };
    let sections = match db::load_sections(&db_pool) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("database load error: {e}");
            std::process::exit(1);
        }
    };

    // Create bounded channels
    let (journal_tx, journal_rx) = mpsc::channel::<JournalEvent>(512);
    let (db_tx, db_rx) = mpsc::channel::<DbCommand>(1024);

    let mut journal = Journal::new(&cfg, IntervalScheduler::new(journal_tx.clone()));
    journal.restore(&sections);

    // Create shared state
    let app_state = AppState::new(journal.snapshot(), journal_tx.clone(), db_tx);

    // ── Spawn tasks ──

    // 1. DB writer task (dedicated, owns the DB connection for writes)
    let writer = tokio::spawn(async move {
        db::run_db_writer(db_pool, db_rx).await;
    });

    // 2. Journal task (sole owner of all journal state)
    let journal_state = app_state.clone();
    let journal_task = tokio::spawn(async move {
        run_journal(journal_state, journal, journal_rx).await;
    });

    // 3. Axum HTTP + WS server
    let app = axum::Router::new()
        .route("/api/state", axum::routing::get(server::routes::get_state))
        .route("/api/stats/test", axum::routing::get(server::routes::get_test_stats))
        .route("/api/stats/live", axum::routing::get(server::routes::get_live_stats))
        .route("/api/stats/simulation", axum::routing::get(server::routes::get_simulation_stats))
        .route("/api/counters", axum::routing::get(server::routes::get_counters))
        .route("/api/command", axum::routing::post(server::routes::post_command))
        .route("/ws", axum::routing::get(server::ws::ws_handler))
        .fallback_service(
            tower_http::services::ServeDir::new("dashboard/dist")
                .fallback(tower_http::services::ServeFile::new("dashboard/dist/index.html")),
        )
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .with_state(app_state.clone());

    let addr = format!("{}:{}", cfg.bind_addr, cfg.server_port);
    tracing::info!("server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("bind error: {e}");
            std::process::exit(1);
        });

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(journal_tx))
        .await
    {
        tracing::error!("server error: {e}");
    }

    // Let the journal archive any running simulation, then give the writer
    // a bounded window to drain queued saves.
    if let Err(e) = journal_task.await {
        tracing::error!("journal task failed: {e}");
    }
    drop(app_state);
    if tokio::time::timeout(Duration::from_secs(5), writer).await.is_err() {
        tracing::warn!("db writer did not drain before exit");
    }
    tracing::info!("factor_journal stopped");
}

async fn shutdown_signal(tx: mpsc::Sender<JournalEvent>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("ctrl-c handler error: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
    let _ = tx.send(JournalEvent::Shutdown).await;
}

/// Journal loop. Receives commands and timer ticks, applies them in order,
/// then persists, broadcasts and republishes the snapshot.
async fn run_journal(state: Arc<AppState>, mut journal: LiveJournal, mut rx: mpsc::Receiver<JournalEvent>) {
    tracing::info!("journal task started");

    while let Some(event) = rx.recv().await {
        if !process_event(event, &mut journal, &state).await {
            break;
        }
    }

    let now = Utc::now();
    let applied = journal.shutdown(now);
    execute_effects(applied, &journal, &state, now, Publish::Snapshot).await;

    tracing::info!("journal task shutting down");
}

/// Returns false once the loop should stop.
async fn process_event(event: JournalEvent, journal: &mut LiveJournal, state: &Arc<AppState>) -> bool {
    let now = Utc::now();
    match event {
        JournalEvent::Command { cmd, reply } => match journal.apply(cmd, now) {
            Ok(applied) => {
                state.counters.commands_applied.fetch_add(1, Ordering::Relaxed);
                execute_effects(applied, journal, state, now, Publish::Snapshot).await;
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                tracing::warn!(error = %e, "command rejected");
                state.counters.commands_rejected.fetch_add(1, Ordering::Relaxed);
                let _ = reply.send(Err(e));
            }
        },

        JournalEvent::SimulationStats { session_id, reply } => {
            let _ = reply.send(journal.simulation_session_stats(session_id.as_deref()));
        }

        JournalEvent::SimTick { epoch } => {
            let (report, applied) = journal.on_tick(epoch, now);
            let publish = match report {
                TickReport::Stale => {
                    state.counters.stale_ticks_dropped.fetch_add(1, Ordering::Relaxed);
                    Publish::Nothing
                }
                TickReport::Recorded { current, total } => {
                    state.counters.iterations_recorded.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(current, total, "simulation iteration recorded");
                    Publish::Progress
                }
                TickReport::Completed { .. } => {
                    state.counters.iterations_recorded.fetch_add(1, Ordering::Relaxed);
                    Publish::Snapshot
                }
            };
            execute_effects(applied, journal, state, now, publish).await;
        }

        JournalEvent::Shutdown => {
            tracing::info!("shutdown event received");
            return false;
        }
    }
    true
}

/// How much of the watched snapshot an event refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Publish {
    Nothing,
    /// Simulation progress fields only, without waking snapshot watchers.
    Progress,
    Snapshot,
}

/// Queue saves for dirty sections, broadcast events, publish the snapshot.
async fn execute_effects(
    applied: Applied,
    journal: &LiveJournal,
    state: &Arc<AppState>,
    now: DateTime<Utc>,
    publish: Publish,
) {
    if applied.dirty.is_empty() && applied.messages.is_empty() {
        return;
    }

    let updated_at = now.to_rfc3339();
    for section in &applied.dirty {
        match journal.section_payload(*section) {
            Ok(payload) => {
                let cmd = DbCommand::SaveSection { section: *section, payload, updated_at: updated_at.clone() };
                if state.db_tx.send(cmd).await.is_err() {
                    tracing::error!(section = %section, "db writer gone, save dropped");
                } else {
                    state.counters.saves_queued.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => tracing::error!(section = %section, error = %e, "section serialization failed"),
        }
    }

    let publish = if applied.dirty.is_empty() { publish } else { Publish::Snapshot };
    match publish {
        Publish::Snapshot => {
            let _ = state.snapshot_tx.send(journal.snapshot());
        }
        Publish::Progress => {
            state.snapshot_tx.send_if_modified(|snapshot| {
                journal.update_progress(&mut snapshot.simulation);
                false
            });
        }
        Publish::Nothing => {}
    }

    if !applied.dirty.is_empty() {
        state.broadcast(WsMessage::JournalUpdated {
            sections: applied.dirty.iter().map(StoreSection::as_str).collect(),
        });
    }
    for msg in applied.messages {
        state.broadcast(msg);
    }
}
