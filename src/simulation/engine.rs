use crate::errors::{JournalError, JournalResult};
use crate::journal::types::{Iteration, MeasurementMode};
use crate::stats::aggregate::{KeyParts, ModelStats, StatsBook};
use crate::stats::key::derive_key;
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;

/// Upper bound on iterations in a single run.
pub const MAX_ITERATIONS: i64 = 1_000_000;

// ── Simulation state machine ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimState {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
}

impl std::fmt::Display for SimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Raw simulation request as it arrives from the UI. Unvalidated.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SimRequest {
    pub iteration_count: i64,
    #[serde(default)]
    pub speed_ms: Option<u64>,
    pub min_factors: i64,
    pub max_factors: i64,
    #[serde(default)]
    pub measurement_mode: MeasurementMode,
}

/// Validated configuration. The engine trusts it without re-checking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimConfig {
    pub iteration_count: u32,
    pub speed: Duration,
    pub min_factors: usize,
    pub max_factors: usize,
    pub measurement_mode: MeasurementMode,
}

impl SimConfig {
    /// Boundary validation. Counts must be positive and `min <= max`; both
    /// bounds are then clamped to `[1, selected]`.
    pub fn validate(req: &SimRequest, selected: usize, default_speed: Duration) -> JournalResult<Self> {
        if selected == 0 {
            return Err(JournalError::Validation("select at least one factor to simulate".into()));
        }
        if req.iteration_count < 1 || req.iteration_count > MAX_ITERATIONS {
            return Err(JournalError::Validation(format!(
                "iteration count must be within 1..={MAX_ITERATIONS}, got {}",
                req.iteration_count
            )));
        }
        if req.min_factors < 1 || req.max_factors < 1 {
            return Err(JournalError::Validation("factor bounds must be at least 1".into()));
        }
        if req.min_factors > req.max_factors {
            return Err(JournalError::Validation(format!(
                "min factors ({}) exceeds max factors ({})",
                req.min_factors, req.max_factors
            )));
        }

        let clamp = |v: i64| (v as usize).clamp(1, selected);
        let speed = req
            .speed_ms
            .map(|ms| Duration::from_millis(ms.max(1)))
            .unwrap_or(default_speed);

        Ok(Self {
            iteration_count: req.iteration_count as u32,
            speed,
            min_factors: clamp(req.min_factors),
            max_factors: clamp(req.max_factors),
            measurement_mode: req.measurement_mode,
        })
    }
}

/// A factor captured for the duration of one run.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SimFactor {
    pub id: String,
    pub name: String,
}

/// Draw `count` uniformly from `[min', max']` (both capped at the pool size),
/// shuffle the pool and take the first `count`.
pub fn draw_subset<'a, R: Rng>(
    factors: &'a [SimFactor],
    min: usize,
    max: usize,
    rng: &mut R,
) -> Vec<&'a SimFactor> {
    let n = factors.len();
    if n == 0 {
        return Vec::new();
    }
    let hi = max.min(n).max(1);
    let lo = min.min(n).clamp(1, hi);
    let count = rng.gen_range(lo..=hi);

    let mut pool: Vec<&SimFactor> = factors.iter().collect();
    pool.shuffle(rng);
    pool.truncate(count);
    pool
}

/// Result of a single engine step.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Engine is not running; nothing recorded.
    Ignored,
    Recorded { current: u32 },
    /// The final iteration was recorded and the run finalized.
    Completed { current: u32 },
}

/// Randomized iteration driver. Owns its RNG so runs are reproducible with a
/// seeded source. Scheduling lives outside; the engine only advances on `step`.
pub struct SimulationEngine<R> {
    state: SimState,
    config: Option<SimConfig>,
    factors: Vec<SimFactor>,
    current_iteration: u32,
    iterations: Vec<Iteration>,
    book: StatsBook,
    final_stats: Option<Vec<ModelStats>>,
    rng: R,
}

impl<R: Rng> SimulationEngine<R> {
    pub fn new(rng: R) -> Self {
        Self {
            state: SimState::Idle,
            config: None,
            factors: Vec::new(),
            current_iteration: 0,
            iterations: Vec::new(),
            book: StatsBook::new(),
            final_stats: None,
            rng,
        }
    }

    #[inline]
    pub fn state(&self) -> SimState {
        self.state
    }

    #[inline]
    pub fn current_iteration(&self) -> u32 {
        self.current_iteration
    }

    pub fn iterations(&self) -> &[Iteration] {
        &self.iterations
    }

    /// Begin a run from `Idle` or `Completed`. A no-op returning false while
    /// a run is in progress.
    pub fn start(&mut self, config: SimConfig, factors: Vec<SimFactor>) -> bool {
        if matches!(self.state, SimState::Running | SimState::Paused) {
            return false;
        }
        self.reset();
        self.iterations.reserve(config.iteration_count.min(100_000) as usize);
        self.config = Some(config);
        self.factors = factors;
        self.state = SimState::Running;
        true
    }

    pub fn pause(&mut self) -> bool {
        if self.state != SimState::Running {
            return false;
        }
        self.state = SimState::Paused;
        true
    }

    pub fn resume(&mut self) -> bool {
        if self.state != SimState::Paused {
            return false;
        }
        self.state = SimState::Running;
        true
    }

    /// Abandon the run and hand back what was recorded. `None` if nothing
    /// was in progress.
    pub fn stop(&mut self) -> Option<Vec<Iteration>> {
        if !matches!(self.state, SimState::Running | SimState::Paused) {
            return None;
        }
        let recorded = std::mem::take(&mut self.iterations);
        self.reset();
        Some(recorded)
    }

    fn reset(&mut self) {
        self.state = SimState::Idle;
        self.config = None;
        self.factors.clear();
        self.current_iteration = 0;
        self.iterations.clear();
        self.book = StatsBook::new();
        self.final_stats = None;
    }

    /// Record one iteration if running. Transitions to `Completed` exactly
    /// once, on the step that reaches the configured count.
    pub fn step(&mut self) -> Step {
        if self.state != SimState::Running {
            return Step::Ignored;
        }
        let Some(config) = self.config else {
            return Step::Ignored;
        };

        if self.current_iteration < config.iteration_count {
            let chosen = draw_subset(&self.factors, config.min_factors, config.max_factors, &mut self.rng);
            let names: Vec<&str> = chosen.iter().map(|f| f.name.as_str()).collect();
            let iteration = Iteration {
                selected_factor_ids: chosen.iter().map(|f| f.id.clone()).collect(),
                model_key: derive_key(&names),
            };
            self.book.record(iteration.model_key.clone(), None);
            self.iterations.push(iteration);
            self.current_iteration += 1;
        }

        if self.current_iteration >= config.iteration_count {
            self.state = SimState::Completed;
            self.final_stats = Some(self.book.finish(&KeyParts));
            return Step::Completed { current: self.current_iteration };
        }
        Step::Recorded { current: self.current_iteration }
    }

    /// Stats for the current or last finished run.
    pub fn stats(&self) -> Vec<ModelStats> {
        match &self.final_stats {
            Some(done) => done.clone(),
            None => self.book.finish(&KeyParts),
        }
    }
}
