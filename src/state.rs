use crate::errors::{JournalError, JournalResult};
use crate::journal::sessions::TradePatch;
use crate::journal::types::{
    Factor, LiveSession, MeasurementMode, Model, SimulationSession, TestSession, TradeMode, TradeResult,
};
use crate::simulation::engine::{SimRequest, SimState};
use crate::stats::aggregate::{ModelStats, SessionSummary};
use chrono::{DateTime, Utc};
use portable_atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

// ── Commands INTO the journal (from the UI surface) ──

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalCommand {
    AddFactor { name: String },
    RenameFactor { id: String, name: String },
    SetFactorSelected { id: String, selected: bool },
    SelectAllFactors { selected: bool },
    MoveFactor { id: String, index: usize },
    DeleteFactor { id: String },

    AddModel { name: String, factors: Vec<String> },
    UpdateModel { id: String, name: String, factors: Vec<String> },
    MoveModel { id: String, index: usize },
    DeleteModel { id: String },

    StartTestSession {
        #[serde(default)]
        measurement_mode: MeasurementMode,
    },
    SelectTestSession { id: String },
    EndTestSession,
    DeleteTestSession { id: String },
    AddTestTrade {
        /// `None` records the currently selected factors.
        #[serde(default)]
        factor_ids: Option<Vec<String>>,
        measurement_value: f64,
        result: TradeResult,
        #[serde(default)]
        notes: Option<String>,
        #[serde(default)]
        images: Vec<String>,
    },

    StartLiveSession {
        #[serde(default)]
        measurement_mode: MeasurementMode,
    },
    AddLiveTrade {
        model_id: String,
        measurement_value: f64,
        result: TradeResult,
        #[serde(default)]
        profit_ratio: Option<f64>,
        #[serde(default)]
        notes: Option<String>,
        #[serde(default)]
        images: Vec<String>,
        /// Mode for a session started implicitly by this trade.
        #[serde(default)]
        measurement_mode: MeasurementMode,
    },
    EndLiveSession,
    DeleteLiveSession { id: String },

    PatchTrade { mode: TradeMode, trade_id: String, patch: TradePatch },
    DeleteTrade { mode: TradeMode, trade_id: String },

    StartSimulation(SimRequest),
    PauseSimulation,
    ResumeSimulation,
    StopSimulation,
    DeleteSimulationSession { id: String },
}

// ── Messages INTO the journal task (bounded channel) ──

#[derive(Debug)]
pub enum JournalEvent {
    Command {
        cmd: JournalCommand,
        reply: oneshot::Sender<JournalResult<()>>,
    },
    /// Stats for the running simulation, or an archived one by id.
    SimulationStats {
        session_id: Option<String>,
        reply: oneshot::Sender<JournalResult<Vec<SimulationStat>>>,
    },
    /// Timer tick tagged with the epoch of the timer that produced it.
    SimTick { epoch: u64 },
    Shutdown,
}

// ── Messages OUT of the journal ──

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    #[serde(rename = "journal_updated")]
    JournalUpdated { sections: Vec<&'static str> },

    #[serde(rename = "simulation_progress")]
    SimulationProgress {
        state: SimState,
        current_iteration: u32,
        iteration_count: u32,
    },

    #[serde(rename = "simulation_completed")]
    SimulationCompleted { session_id: String, iterations: u32 },

    #[serde(rename = "session_ended")]
    SessionEnded {
        mode: &'static str,
        session_id: String,
        archived: bool,
        records: usize,
    },
}

// ── Persistence ──

/// Independently persisted slice of journal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreSection {
    Factors,
    Models,
    TestSessions,
    LiveSessions,
    SimulationSessions,
}

impl StoreSection {
    pub const ALL: [StoreSection; 5] = [
        StoreSection::Factors,
        StoreSection::Models,
        StoreSection::TestSessions,
        StoreSection::LiveSessions,
        StoreSection::SimulationSessions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Factors => "factors",
            Self::Models => "models",
            Self::TestSessions => "test_sessions",
            Self::LiveSessions => "live_sessions",
            Self::SimulationSessions => "simulation_sessions",
        }
    }
}

impl std::fmt::Display for StoreSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sent to the writer task via bounded channel.
#[derive(Debug)]
pub enum DbCommand {
    SaveSection {
        section: StoreSection,
        payload: String,
        updated_at: String,
    },
}

// ── Journal snapshot for the UI (sent via watch channel) ──

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TestView {
    pub sessions: Vec<TestSession>,
    pub current_id: Option<String>,
    pub stats: Vec<ModelStats>,
    pub summary: SessionSummary,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct LiveView {
    pub current: Option<LiveSession>,
    pub history: Vec<LiveSession>,
    pub stats: Vec<ModelStats>,
    pub summary: SessionSummary,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SimulationStat {
    #[serde(flatten)]
    pub stats: ModelStats,
    /// Percent of all recorded iterations.
    pub share: f64,
}

/// Archived simulation without its iteration list.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SimulationSummary {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub measurement_mode: MeasurementMode,
    pub iteration_count: u32,
    pub min_factors: usize,
    pub max_factors: usize,
    /// Iterations actually recorded; below `iteration_count` for stopped runs.
    pub recorded: usize,
}

impl From<&SimulationSession> for SimulationSummary {
    fn from(s: &SimulationSession) -> Self {
        Self {
            id: s.id.clone(),
            start_time: s.start_time,
            end_time: s.end_time,
            measurement_mode: s.measurement_mode,
            iteration_count: s.iteration_count,
            min_factors: s.min_factors,
            max_factors: s.max_factors,
            recorded: s.iterations.len(),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SimulationView {
    pub state: SimState,
    pub session_id: Option<String>,
    pub current_iteration: u32,
    pub iteration_count: u32,
    pub stats: Vec<SimulationStat>,
    pub history: Vec<SimulationSummary>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct JournalSnapshot {
    pub factors: Vec<Factor>,
    pub models: Vec<Model>,
    pub test: TestView,
    pub live: LiveView,
    pub simulation: SimulationView,
}

// ── Performance Counters (lock-free) ──

pub struct PerfCounters {
    pub commands_applied: AtomicU64,
    pub commands_rejected: AtomicU64,
    pub iterations_recorded: AtomicU64,
    pub stale_ticks_dropped: AtomicU64,
    pub saves_queued: AtomicU64,
    pub ws_messages_sent: AtomicU64,
}

impl PerfCounters {
    pub fn new() -> Self {
        Self {
            commands_applied: AtomicU64::new(0),
            commands_rejected: AtomicU64::new(0),
            iterations_recorded: AtomicU64::new(0),
            stale_ticks_dropped: AtomicU64::new(0),
            saves_queued: AtomicU64::new(0),
            ws_messages_sent: AtomicU64::new(0),
        }
    }
}

impl Default for PerfCounters {
    fn default() -> Self {
        Self::new()
    }
}

// ── Application shared state (channels, not locks) ──

pub struct AppState {
    // Journal -> UI: latest snapshot (watch = single producer, multi consumer)
    pub snapshot_tx: watch::Sender<JournalSnapshot>,
    pub snapshot_rx: watch::Receiver<JournalSnapshot>,

    // Journal -> UI: event stream (broadcast for WS clients)
    pub ws_tx: broadcast::Sender<WsMessage>,

    // UI/Timer -> Journal: bounded event channel
    pub journal_tx: mpsc::Sender<JournalEvent>,

    // Journal -> DB Writer: bounded command channel
    pub db_tx: mpsc::Sender<DbCommand>,

    pub counters: PerfCounters,
}

impl AppState {
    pub fn new(
        initial: JournalSnapshot,
        journal_tx: mpsc::Sender<JournalEvent>,
        db_tx: mpsc::Sender<DbCommand>,
    ) -> Arc<Self> {
        let (ws_tx, _) = broadcast::channel(1024);
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);

        Arc::new(Self {
            snapshot_tx,
            snapshot_rx,
            ws_tx,
            journal_tx,
            db_tx,
            counters: PerfCounters::new(),
        })
    }

    #[inline]
    pub fn broadcast(&self, msg: WsMessage) {
        self.counters.ws_messages_sent.fetch_add(1, Ordering::Relaxed);
        let _ = self.ws_tx.send(msg);
    }

    /// Hand a command to the journal task and wait for its verdict.
    pub async fn submit(&self, cmd: JournalCommand) -> JournalResult<()> {
        let (reply, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalEvent::Command { cmd, reply })
            .await
            .map_err(|_| JournalError::ChannelClosed("journal".into()))?;
        rx.await
            .map_err(|_| JournalError::ChannelClosed("journal reply".into()))?
    }

    /// Ask the journal task for simulation stats. Archived iterations never
    /// ride on the snapshot, so they are aggregated on request.
    pub async fn simulation_stats(&self, session_id: Option<String>) -> JournalResult<Vec<SimulationStat>> {
        let (reply, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalEvent::SimulationStats { session_id, reply })
            .await
            .map_err(|_| JournalError::ChannelClosed("journal".into()))?;
        rx.await
            .map_err(|_| JournalError::ChannelClosed("journal reply".into()))?
    }
}
