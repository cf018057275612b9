use crate::errors::{JournalError, JournalResult};
use crate::journal::sessions::{retire, SessionEnd};
use crate::journal::types::{new_id, Iteration, SimulationSession};
use crate::simulation::engine::{SimConfig, SimFactor, SimState, SimulationEngine, Step};
use crate::simulation::scheduler::TickScheduler;
use crate::stats::aggregate::ModelStats;
use chrono::{DateTime, Utc};
use rand::Rng;

pub const DEFAULT_SIMULATION_HISTORY_CAP: usize = 50;

/// What a timer tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickReport {
    /// From a cancelled or replaced timer, or the engine is not running.
    Stale,
    Recorded { current: u32, total: u32 },
    Completed { session_id: String, iterations: u32 },
}

#[derive(Debug, Clone)]
struct ActiveRun {
    id: String,
    start_time: DateTime<Utc>,
    config: SimConfig,
}

/// Binds the engine to exactly one scheduler handle and owns the simulation
/// session history. Every transition out of `Running` cancels the timer.
pub struct SimulationRunner<S: TickScheduler, R: Rng> {
    engine: SimulationEngine<R>,
    scheduler: S,
    epoch: u64,
    run: Option<ActiveRun>,
    history: Vec<SimulationSession>,
    cap: usize,
}

impl<S: TickScheduler, R: Rng> SimulationRunner<S, R> {
    pub fn new(scheduler: S, rng: R, cap: usize) -> Self {
        Self {
            engine: SimulationEngine::new(rng),
            scheduler,
            epoch: 0,
            run: None,
            history: Vec::new(),
            cap: cap.max(1),
        }
    }

    pub fn restore_history(&mut self, mut history: Vec<SimulationSession>) {
        history.truncate(self.cap);
        self.history = history;
    }

    pub fn history(&self) -> &[SimulationSession] {
        &self.history
    }

    #[inline]
    pub fn state(&self) -> SimState {
        self.engine.state()
    }

    #[inline]
    pub fn current_iteration(&self) -> u32 {
        self.engine.current_iteration()
    }

    pub fn iteration_count(&self) -> u32 {
        self.run.as_ref().map(|r| r.config.iteration_count).unwrap_or(0)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.run.as_ref().map(|r| r.id.as_str())
    }

    pub fn stats(&self) -> Vec<ModelStats> {
        self.engine.stats()
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    fn arm(&mut self, config: &SimConfig) {
        self.epoch += 1;
        self.scheduler.schedule(config.speed, self.epoch);
    }

    /// Start a new run. Returns false (and changes nothing) while a run is
    /// already running or paused.
    pub fn start(&mut self, config: SimConfig, factors: Vec<SimFactor>, now: DateTime<Utc>) -> bool {
        let factor_count = factors.len();
        if !self.engine.start(config, factors) {
            tracing::debug!(state = %self.engine.state(), "simulation start ignored");
            return false;
        }
        let run = ActiveRun { id: new_id(), start_time: now, config };
        tracing::info!(
            session_id = %run.id,
            iterations = config.iteration_count,
            factors = factor_count,
            min = config.min_factors,
            max = config.max_factors,
            speed_ms = config.speed.as_millis() as u64,
            "simulation started"
        );
        self.run = Some(run);
        self.arm(&config);
        true
    }

    pub fn pause(&mut self) -> bool {
        if !self.engine.pause() {
            return false;
        }
        self.scheduler.cancel();
        tracing::info!(at = self.engine.current_iteration(), "simulation paused");
        true
    }

    pub fn resume(&mut self) -> bool {
        let Some(config) = self.run.as_ref().map(|r| r.config) else {
            return false;
        };
        if !self.engine.resume() {
            return false;
        }
        self.arm(&config);
        tracing::info!(at = self.engine.current_iteration(), "simulation resumed");
        true
    }

    /// Cancel the timer immediately and archive what was recorded. A run
    /// with no iterations is discarded.
    pub fn stop(&mut self, now: DateTime<Utc>) -> Option<SessionEnd> {
        self.scheduler.cancel();
        let recorded = self.engine.stop()?;
        let run = self.run.take()?;
        if recorded.is_empty() {
            tracing::info!(session_id = %run.id, "empty simulation discarded");
            return Some(SessionEnd::Discarded { id: run.id });
        }
        let records = recorded.len();
        let id = run.id.clone();
        retire(&mut self.history, freeze(run, recorded, now), self.cap);
        tracing::info!(session_id = %id, iterations = records, "simulation stopped");
        Some(SessionEnd::Archived { id, records })
    }

    /// Advance one iteration for a tick from timer `epoch`.
    pub fn on_tick(&mut self, epoch: u64, now: DateTime<Utc>) -> TickReport {
        if epoch != self.epoch {
            tracing::debug!(epoch, current = self.epoch, "stale simulation tick dropped");
            return TickReport::Stale;
        }
        match self.engine.step() {
            Step::Ignored => TickReport::Stale,
            Step::Recorded { current } => {
                debug_assert!(self.scheduler.is_active(), "recording without a live timer");
                TickReport::Recorded { current, total: self.iteration_count() }
            }
            Step::Completed { current } => {
                self.scheduler.cancel();
                let Some(run) = self.run.clone() else {
                    return TickReport::Stale;
                };
                let session = freeze(run, self.engine.iterations().to_vec(), now);
                let session_id = session.id.clone();
                retire(&mut self.history, session, self.cap);
                tracing::info!(session_id = %session_id, iterations = current, "simulation completed");
                TickReport::Completed { session_id, iterations: current }
            }
        }
    }

    pub fn delete(&mut self, id: &str) -> JournalResult<()> {
        let before = self.history.len();
        self.history.retain(|s| s.id != id);
        if self.history.len() == before {
            return Err(JournalError::not_found("simulation session", id));
        }
        Ok(())
    }
}

fn freeze(run: ActiveRun, iterations: Vec<Iteration>, now: DateTime<Utc>) -> SimulationSession {
    SimulationSession {
        id: run.id,
        start_time: run.start_time,
        end_time: Some(now),
        measurement_mode: run.config.measurement_mode,
        iteration_count: run.config.iteration_count,
        min_factors: run.config.min_factors,
        max_factors: run.config.max_factors,
        iterations,
    }
}
