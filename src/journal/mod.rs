pub mod catalog;
pub mod sessions;
pub mod types;

use crate::config::AppConfig;
use crate::errors::{JournalError, JournalResult};
use crate::simulation::engine::{SimConfig, SimFactor, SimState};
use crate::simulation::runner::{SimulationRunner, TickReport};
use crate::simulation::scheduler::TickScheduler;
use crate::state::{
    JournalCommand, JournalSnapshot, LiveView, SimulationStat, SimulationSummary, SimulationView, StoreSection,
    TestView, WsMessage,
};
use crate::stats::aggregate::{self, frequency_share, sort_stats, ModelStats, StatsOrder};
use crate::stats::key::{derive_key, ModelKey};
use catalog::{FactorBook, ModelBook};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use sessions::{LiveSessions, SessionEnd, TestSessions};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::time::Duration;
use types::{Iteration, LiveSession, LiveTrade, SimulationSession, TestSession, TestTrade, TradeMode};

/// Side effects of one applied command or tick, executed by the owner task.
#[derive(Debug, Default)]
pub struct Applied {
    pub dirty: SmallVec<[StoreSection; 4]>,
    pub messages: SmallVec<[WsMessage; 2]>,
}

impl Applied {
    fn dirty(sections: &[StoreSection]) -> Self {
        Self { dirty: sections.iter().copied().collect(), messages: SmallVec::new() }
    }

    fn with(mut self, msg: WsMessage) -> Self {
        self.messages.push(msg);
        self
    }
}

fn session_ended(mode: &'static str, end: &SessionEnd) -> WsMessage {
    let (session_id, archived, records) = match end {
        SessionEnd::Discarded { id } => (id.clone(), false, 0),
        SessionEnd::Archived { id, records } => (id.clone(), true, *records),
    };
    WsMessage::SessionEnded { mode, session_id, archived, records }
}

fn measurement_value(v: f64) -> JournalResult<f64> {
    if v.is_finite() && v > 0.0 {
        Ok(v)
    } else {
        Err(JournalError::Validation(format!("measurement value must be a positive number, got {v}")))
    }
}

// ── Stats per call site ──

/// Test-mode stats: keyed by factor ids, names resolved from the current table.
pub fn test_session_stats(session: &TestSession, factors: &FactorBook) -> Vec<ModelStats> {
    let mut stats = aggregate::aggregate(
        &session.trades,
        session.measurement_mode,
        |t: &TestTrade| derive_key(&t.factor_ids),
        factors,
    );
    sort_stats(&mut stats, StatsOrder::WinRate);
    stats
}

/// Live-mode stats: keyed by the curated model id.
pub fn live_session_stats(session: &LiveSession, models: &ModelBook) -> Vec<ModelStats> {
    let mut stats = aggregate::aggregate(
        &session.trades,
        session.measurement_mode,
        |t: &LiveTrade| ModelKey::from_raw(t.model_id.clone()),
        models,
    );
    sort_stats(&mut stats, StatsOrder::WinRate);
    stats
}

/// Simulation stats with each bucket's share of all iterations.
pub fn simulation_stats(mut stats: Vec<ModelStats>) -> Vec<SimulationStat> {
    sort_stats(&mut stats, StatsOrder::TradeCount);
    let total: u64 = stats.iter().map(|s| s.total_count).sum();
    stats
        .into_iter()
        .map(|s| SimulationStat { share: frequency_share(&s, total), stats: s })
        .collect()
}

/// Composition root. Owns every store; all mutation goes through `apply`
/// and `on_tick`, which one task calls sequentially.
pub struct Journal<S: TickScheduler> {
    factors: FactorBook,
    models: ModelBook,
    test: TestSessions,
    live: LiveSessions,
    simulation: SimulationRunner<S, StdRng>,
    default_speed: Duration,
    live_cap: usize,
}

impl<S: TickScheduler> Journal<S> {
    pub fn new(config: &AppConfig, scheduler: S) -> Self {
        let rng = match config.sim_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            factors: FactorBook::default(),
            models: ModelBook::default(),
            test: TestSessions::default(),
            live: LiveSessions::with_cap(config.live_history_cap),
            simulation: SimulationRunner::new(scheduler, rng, config.simulation_history_cap),
            default_speed: config.sim_default_speed,
            live_cap: config.live_history_cap,
        }
    }

    pub fn simulation(&self) -> &SimulationRunner<S, StdRng> {
        &self.simulation
    }

    /// Load persisted sections. A section that fails to parse is logged and
    /// left at its empty default.
    pub fn restore(&mut self, sections: &HashMap<String, String>) {
        for section in StoreSection::ALL {
            let Some(payload) = sections.get(section.as_str()) else {
                continue;
            };
            if let Err(e) = self.restore_section(section, payload) {
                tracing::warn!(section = %section, error = %e, "persisted section unreadable, starting empty");
            }
        }
        tracing::info!(
            factors = self.factors.all().len(),
            models = self.models.all().len(),
            test_sessions = self.test.sessions().len(),
            live_history = self.live.history().len(),
            simulation_history = self.simulation.history().len(),
            "journal restored"
        );
    }

    fn restore_section(&mut self, section: StoreSection, payload: &str) -> JournalResult<()> {
        match section {
            StoreSection::Factors => {
                self.factors = FactorBook::from_factors(serde_json::from_str(payload)?);
            }
            StoreSection::Models => {
                self.models = ModelBook::from_models(serde_json::from_str(payload)?);
            }
            StoreSection::TestSessions => {
                self.test = serde_json::from_str(payload)?;
            }
            StoreSection::LiveSessions => {
                let mut live: LiveSessions = serde_json::from_str(payload)?;
                live.set_cap(self.live_cap);
                self.live = live;
            }
            StoreSection::SimulationSessions => {
                let history: Vec<SimulationSession> = serde_json::from_str(payload)?;
                self.simulation.restore_history(history);
            }
        }
        Ok(())
    }

    /// Serialized form of one section for the persistence collaborator.
    pub fn section_payload(&self, section: StoreSection) -> JournalResult<String> {
        let json = match section {
            StoreSection::Factors => serde_json::to_string(&self.factors)?,
            StoreSection::Models => serde_json::to_string(&self.models)?,
            StoreSection::TestSessions => serde_json::to_string(&self.test)?,
            StoreSection::LiveSessions => serde_json::to_string(&self.live)?,
            StoreSection::SimulationSessions => serde_json::to_string(self.simulation.history())?,
        };
        Ok(json)
    }

    pub fn apply(&mut self, cmd: JournalCommand, now: DateTime<Utc>) -> JournalResult<Applied> {
        let applied = match cmd {
            // ── Catalog ──
            JournalCommand::AddFactor { name } => {
                let factor = self.factors.add(&name)?;
                tracing::info!(factor_id = %factor.id, name = %factor.name, "factor added");
                Applied::dirty(&[StoreSection::Factors])
            }
            JournalCommand::RenameFactor { id, name } => {
                let old = self.factors.rename(&id, &name)?;
                let new = self.factors.get(&id).map(|f| f.name.clone()).unwrap_or_default();
                if self.models.rename_factor(&old, &new) > 0 {
                    Applied::dirty(&[StoreSection::Factors, StoreSection::Models])
                } else {
                    Applied::dirty(&[StoreSection::Factors])
                }
            }
            JournalCommand::SetFactorSelected { id, selected } => {
                self.factors.set_selected(&id, selected)?;
                Applied::dirty(&[StoreSection::Factors])
            }
            JournalCommand::SelectAllFactors { selected } => {
                self.factors.select_all(selected);
                Applied::dirty(&[StoreSection::Factors])
            }
            JournalCommand::MoveFactor { id, index } => {
                self.factors.move_to(&id, index)?;
                Applied::dirty(&[StoreSection::Factors])
            }
            JournalCommand::DeleteFactor { id } => {
                let removed = self.factors.delete(&id)?;
                tracing::info!(factor_id = %removed.id, name = %removed.name, "factor deleted");
                Applied::dirty(&[StoreSection::Factors])
            }
            JournalCommand::AddModel { name, factors } => {
                self.check_model_factors(&factors)?;
                self.models.add(&name, &factors)?;
                Applied::dirty(&[StoreSection::Models])
            }
            JournalCommand::UpdateModel { id, name, factors } => {
                self.check_model_factors(&factors)?;
                self.models.update(&id, &name, &factors)?;
                Applied::dirty(&[StoreSection::Models])
            }
            JournalCommand::MoveModel { id, index } => {
                self.models.move_to(&id, index)?;
                Applied::dirty(&[StoreSection::Models])
            }
            JournalCommand::DeleteModel { id } => {
                self.models.delete(&id)?;
                Applied::dirty(&[StoreSection::Models])
            }

            // ── Test mode ──
            JournalCommand::StartTestSession { measurement_mode } => {
                self.test.start(measurement_mode, now);
                Applied::dirty(&[StoreSection::TestSessions])
            }
            JournalCommand::SelectTestSession { id } => {
                self.test.select(&id)?;
                Applied::dirty(&[StoreSection::TestSessions])
            }
            JournalCommand::EndTestSession => {
                let end = self.test.end(now)?;
                Applied::dirty(&[StoreSection::TestSessions]).with(session_ended("test", &end))
            }
            JournalCommand::DeleteTestSession { id } => {
                self.test.delete(&id)?;
                Applied::dirty(&[StoreSection::TestSessions])
            }
            JournalCommand::AddTestTrade { factor_ids, measurement_value: value, result, notes, images } => {
                let value = measurement_value(value)?;
                let factor_ids = self.trade_factor_ids(factor_ids)?;
                self.test.add_trade(TestTrade {
                    id: types::new_id(),
                    timestamp: now,
                    factor_ids,
                    measurement_value: value,
                    result,
                    notes: notes.filter(|n| !n.trim().is_empty()),
                    images,
                })?;
                Applied::dirty(&[StoreSection::TestSessions])
            }

            // ── Live mode ──
            JournalCommand::StartLiveSession { measurement_mode } => {
                self.live.start(measurement_mode, now)?;
                Applied::dirty(&[StoreSection::LiveSessions])
            }
            JournalCommand::AddLiveTrade {
                model_id,
                measurement_value: value,
                result,
                profit_ratio,
                notes,
                images,
                measurement_mode,
            } => {
                let value = measurement_value(value)?;
                if self.models.get(&model_id).is_none() {
                    return Err(JournalError::not_found("model", model_id));
                }
                if let Some(ratio) = profit_ratio {
                    if !ratio.is_finite() || ratio < 0.0 {
                        return Err(JournalError::Validation(format!(
                            "profit ratio must be a non-negative number, got {ratio}"
                        )));
                    }
                }
                let trade = LiveTrade {
                    id: types::new_id(),
                    timestamp: now,
                    model_id,
                    measurement_value: value,
                    result,
                    profit_ratio,
                    notes: notes.filter(|n| !n.trim().is_empty()),
                    images,
                };
                self.live.add_trade(trade, measurement_mode, now);
                Applied::dirty(&[StoreSection::LiveSessions])
            }
            JournalCommand::EndLiveSession => {
                let end = self.live.end(now)?;
                Applied::dirty(&[StoreSection::LiveSessions]).with(session_ended("live", &end))
            }
            JournalCommand::DeleteLiveSession { id } => {
                self.live.delete(&id)?;
                Applied::dirty(&[StoreSection::LiveSessions])
            }

            // ── Trade annotation ──
            JournalCommand::PatchTrade { mode, trade_id, patch } => match mode {
                TradeMode::Test => {
                    self.test.patch_trade(&trade_id, &patch)?;
                    Applied::dirty(&[StoreSection::TestSessions])
                }
                TradeMode::Live => {
                    self.live.patch_trade(&trade_id, &patch)?;
                    Applied::dirty(&[StoreSection::LiveSessions])
                }
            },
            JournalCommand::DeleteTrade { mode, trade_id } => match mode {
                TradeMode::Test => {
                    self.test.delete_trade(&trade_id)?;
                    Applied::dirty(&[StoreSection::TestSessions])
                }
                TradeMode::Live => {
                    self.live.delete_trade(&trade_id)?;
                    Applied::dirty(&[StoreSection::LiveSessions])
                }
            },

            // ── Simulation ──
            JournalCommand::StartSimulation(req) => {
                if matches!(self.simulation.state(), SimState::Running | SimState::Paused) {
                    return Ok(Applied::default().with(self.progress()));
                }
                let factors: Vec<SimFactor> = self
                    .factors
                    .selected()
                    .map(|f| SimFactor { id: f.id.clone(), name: f.name.clone() })
                    .collect();
                let config = SimConfig::validate(&req, factors.len(), self.default_speed)?;
                self.simulation.start(config, factors, now);
                Applied::default().with(self.progress())
            }
            JournalCommand::PauseSimulation => {
                self.simulation.pause();
                Applied::default().with(self.progress())
            }
            JournalCommand::ResumeSimulation => {
                self.simulation.resume();
                Applied::default().with(self.progress())
            }
            JournalCommand::StopSimulation => match self.simulation.stop(now) {
                Some(end) => {
                    let applied = match end {
                        SessionEnd::Archived { .. } => Applied::dirty(&[StoreSection::SimulationSessions]),
                        SessionEnd::Discarded { .. } => Applied::default(),
                    };
                    applied.with(session_ended("simulation", &end)).with(self.progress())
                }
                None => Applied::default(),
            },
            JournalCommand::DeleteSimulationSession { id } => {
                self.simulation.delete(&id)?;
                Applied::dirty(&[StoreSection::SimulationSessions])
            }
        };
        Ok(applied)
    }

    /// Models list factors by name; every name must exist when the model is saved.
    fn check_model_factors(&self, names: &[String]) -> JournalResult<()> {
        for name in names {
            let name = name.trim();
            if !self.factors.all().iter().any(|f| f.name == name) {
                return Err(JournalError::not_found("factor", name));
            }
        }
        Ok(())
    }

    /// Explicit ids are de-duplicated and must exist. Without ids the
    /// currently selected factors are used.
    fn trade_factor_ids(&self, ids: Option<Vec<String>>) -> JournalResult<Vec<String>> {
        let mut ids = match ids {
            Some(ids) => {
                for id in &ids {
                    if self.factors.get(id).is_none() {
                        return Err(JournalError::not_found("factor", id.clone()));
                    }
                }
                ids
            }
            None => self.factors.selected().map(|f| f.id.clone()).collect(),
        };
        let mut seen = std::collections::HashSet::with_capacity(ids.len());
        ids.retain(|id| seen.insert(id.clone()));
        if ids.is_empty() {
            return Err(JournalError::Validation("a trade needs at least one factor".into()));
        }
        Ok(ids)
    }

    fn progress(&self) -> WsMessage {
        WsMessage::SimulationProgress {
            state: self.simulation.state(),
            current_iteration: self.simulation.current_iteration(),
            iteration_count: self.simulation.iteration_count(),
        }
    }

    pub fn on_tick(&mut self, epoch: u64, now: DateTime<Utc>) -> (TickReport, Applied) {
        let report = self.simulation.on_tick(epoch, now);
        let applied = match &report {
            TickReport::Stale => Applied::default(),
            TickReport::Recorded { .. } => Applied::default().with(self.progress()),
            TickReport::Completed { session_id, iterations } => Applied::dirty(&[StoreSection::SimulationSessions])
                .with(WsMessage::SimulationCompleted { session_id: session_id.clone(), iterations: *iterations })
                .with(self.progress()),
        };
        (report, applied)
    }

    /// Stop any in-flight simulation. Called when the owner task tears down.
    pub fn shutdown(&mut self, now: DateTime<Utc>) -> Applied {
        match self.simulation.stop(now) {
            Some(SessionEnd::Archived { .. }) => Applied::dirty(&[StoreSection::SimulationSessions]),
            _ => Applied::default(),
        }
    }

    pub fn snapshot(&self) -> JournalSnapshot {
        let test = self.test.current();
        let live = self.live.current();
        JournalSnapshot {
            factors: self.factors.all().to_vec(),
            models: self.models.all().to_vec(),
            test: TestView {
                sessions: self.test.sessions().to_vec(),
                current_id: self.test.current_id().map(str::to_string),
                stats: test.map(|s| test_session_stats(s, &self.factors)).unwrap_or_default(),
                summary: test
                    .map(|s| aggregate::summarize(&s.trades, s.measurement_mode))
                    .unwrap_or_default(),
            },
            live: LiveView {
                current: live.cloned(),
                history: self.live.history().to_vec(),
                stats: live.map(|s| live_session_stats(s, &self.models)).unwrap_or_default(),
                summary: live
                    .map(|s| aggregate::summarize(&s.trades, s.measurement_mode))
                    .unwrap_or_default(),
            },
            simulation: SimulationView {
                state: self.simulation.state(),
                session_id: self.simulation.session_id().map(str::to_string),
                current_iteration: self.simulation.current_iteration(),
                iteration_count: self.simulation.iteration_count(),
                stats: simulation_stats(self.simulation.stats()),
                history: self.simulation.history().iter().map(SimulationSummary::from).collect(),
            },
        }
    }

    /// Refresh the progress fields of a published view without rebuilding it.
    pub fn update_progress(&self, view: &mut SimulationView) {
        view.state = self.simulation.state();
        view.session_id = self.simulation.session_id().map(str::to_string);
        view.current_iteration = self.simulation.current_iteration();
        view.iteration_count = self.simulation.iteration_count();
    }

    /// Stats of the current run, or of an archived run when `session_id` is given.
    pub fn simulation_session_stats(&self, session_id: Option<&str>) -> JournalResult<Vec<SimulationStat>> {
        let Some(id) = session_id else {
            return Ok(simulation_stats(self.simulation.stats()));
        };
        let session = self
            .simulation
            .history()
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| JournalError::not_found("simulation session", id))?;
        let raw = aggregate::aggregate(
            &session.iterations,
            session.measurement_mode,
            |it: &Iteration| it.model_key.clone(),
            &aggregate::KeyParts,
        );
        Ok(simulation_stats(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::engine::SimRequest;
    use crate::simulation::scheduler::ManualScheduler;
    use crate::stats::aggregate::DELETED_FACTOR;
    use types::{MeasurementMode, TradeResult};

    fn journal() -> Journal<ManualScheduler> {
        let config = AppConfig { sim_seed: Some(5), ..AppConfig::default() };
        Journal::new(&config, ManualScheduler::default())
    }

    fn apply(j: &mut Journal<ManualScheduler>, cmd: JournalCommand) -> Applied {
        j.apply(cmd, Utc::now()).expect("command applies")
    }

    fn add_factors(j: &mut Journal<ManualScheduler>, names: &[&str]) -> Vec<String> {
        for n in names {
            apply(j, JournalCommand::AddFactor { name: n.to_string() });
        }
        j.factors.all().iter().map(|f| f.id.clone()).collect()
    }

    fn test_trade(ids: &[&String], result: TradeResult, value: f64) -> JournalCommand {
        JournalCommand::AddTestTrade {
            factor_ids: Some(ids.iter().map(|s| s.to_string()).collect()),
            measurement_value: value,
            result,
            notes: None,
            images: Vec::new(),
        }
    }

    #[test]
    fn test_basic_aggregation_through_journal() {
        let mut j = journal();
        let ids = add_factors(&mut j, &["A", "B"]);
        apply(&mut j, JournalCommand::StartTestSession { measurement_mode: MeasurementMode::RiskReward });
        apply(&mut j, test_trade(&[&ids[0], &ids[1]], TradeResult::Win, 2.0));
        apply(&mut j, test_trade(&[&ids[1], &ids[0]], TradeResult::Lose, 1.0));

        let snap = j.snapshot();
        assert_eq!(snap.test.stats.len(), 1);
        let s = &snap.test.stats[0];
        assert_eq!((s.total_count, s.wins, s.losses), (2, 1, 1));
        assert_eq!(s.win_rate, 50.0);
        assert_eq!(snap.test.summary.total_count, 2);
    }

    #[test]
    fn test_rename_and_delete_resolve_at_render_time() {
        let mut j = journal();
        let ids = add_factors(&mut j, &["Trend", "Volume"]);
        apply(&mut j, JournalCommand::StartTestSession { measurement_mode: MeasurementMode::Dollar });
        apply(&mut j, test_trade(&[&ids[0], &ids[1]], TradeResult::Win, 10.0));
        let key_before = j.snapshot().test.stats[0].model_key.clone();

        apply(&mut j, JournalCommand::RenameFactor { id: ids[0].clone(), name: "Momentum".into() });
        let snap = j.snapshot();
        assert_eq!(snap.test.stats[0].model_key, key_before, "key survives renames");
        assert!(snap.test.stats[0].factor_names.contains(&"Momentum".to_string()));

        apply(&mut j, JournalCommand::DeleteFactor { id: ids[1].clone() });
        let names = &j.snapshot().test.stats[0].factor_names;
        assert!(names.contains(&DELETED_FACTOR.to_string()));
    }

    #[test]
    fn test_trade_uses_selected_factors_by_default() {
        let mut j = journal();
        let ids = add_factors(&mut j, &["A", "B", "C"]);
        apply(&mut j, JournalCommand::SetFactorSelected { id: ids[2].clone(), selected: true });
        apply(&mut j, JournalCommand::StartTestSession { measurement_mode: MeasurementMode::RiskReward });
        apply(
            &mut j,
            JournalCommand::AddTestTrade {
                factor_ids: None,
                measurement_value: 1.0,
                result: TradeResult::Win,
                notes: Some("   ".into()),
                images: Vec::new(),
            },
        );
        let trade = &j.test.current().unwrap().trades[0];
        assert_eq!(trade.factor_ids, vec![ids[2].clone()]);
        assert!(trade.notes.is_none());
    }

    #[test]
    fn test_rejects_invalid_trades() {
        let mut j = journal();
        let ids = add_factors(&mut j, &["A"]);
        apply(&mut j, JournalCommand::StartTestSession { measurement_mode: MeasurementMode::RiskReward });
        assert!(j.apply(test_trade(&[&ids[0]], TradeResult::Win, 0.0), Utc::now()).is_err());
        assert!(j.apply(test_trade(&[&ids[0]], TradeResult::Win, f64::NAN), Utc::now()).is_err());
        let missing = "missing".to_string();
        assert!(j.apply(test_trade(&[&missing], TradeResult::Win, 1.0), Utc::now()).is_err());
        assert!(j.test.current().unwrap().trades.is_empty());
    }

    #[test]
    fn test_live_flow_autostart_and_discard() {
        let mut j = journal();
        add_factors(&mut j, &["Trend"]);
        apply(&mut j, JournalCommand::StartLiveSession { measurement_mode: MeasurementMode::RiskReward });
        let applied = apply(&mut j, JournalCommand::EndLiveSession);
        assert!(matches!(applied.messages[0], WsMessage::SessionEnded { archived: false, .. }));
        assert!(j.snapshot().live.history.is_empty());

        apply(&mut j, JournalCommand::AddModel { name: "Breakout".into(), factors: vec!["Trend".into()] });
        let model_id = j.models.all()[0].id.clone();
        apply(
            &mut j,
            JournalCommand::AddLiveTrade {
                model_id,
                measurement_value: 1.0,
                result: TradeResult::Win,
                profit_ratio: Some(2.0),
                notes: None,
                images: Vec::new(),
                measurement_mode: MeasurementMode::RiskReward,
            },
        );
        let snap = j.snapshot();
        assert!(snap.live.current.is_some(), "trade auto-starts a live session");
        assert_eq!(snap.live.stats[0].label, "Breakout");
        assert!((snap.live.stats[0].win_value - 2.0).abs() < 1e-12);

        apply(&mut j, JournalCommand::EndLiveSession);
        assert_eq!(j.snapshot().live.history.len(), 1);
    }

    #[test]
    fn test_model_requires_known_factors() {
        let mut j = journal();
        add_factors(&mut j, &["Trend"]);
        let err = j.apply(
            JournalCommand::AddModel { name: "X".into(), factors: vec!["Unknown".into()] },
            Utc::now(),
        );
        assert!(matches!(err, Err(JournalError::NotFound { kind: "factor", .. })));
    }

    #[test]
    fn test_simulation_through_journal() {
        let mut j = journal();
        add_factors(&mut j, &["A", "B", "C"]);
        apply(&mut j, JournalCommand::SelectAllFactors { selected: true });
        apply(
            &mut j,
            JournalCommand::StartSimulation(SimRequest {
                iteration_count: 4,
                speed_ms: Some(5),
                min_factors: 1,
                max_factors: 5,
                measurement_mode: MeasurementMode::RiskReward,
            }),
        );
        let epoch = j.simulation().scheduler().active.map(|(_, e)| e).unwrap();
        let mut completed = None;
        for _ in 0..4 {
            let (report, applied) = j.on_tick(epoch, Utc::now());
            if matches!(report, TickReport::Completed { .. }) {
                completed = Some(applied);
            }
        }
        let applied = completed.expect("run completes on the fourth tick");
        assert_eq!(applied.dirty.as_slice(), &[StoreSection::SimulationSessions]);

        let snap = j.snapshot();
        assert_eq!(snap.simulation.state, SimState::Completed);
        assert_eq!(snap.simulation.current_iteration, 4);
        let share: f64 = snap.simulation.stats.iter().map(|s| s.share).sum();
        assert!((share - 100.0).abs() < 1e-9);
        assert_eq!(snap.simulation.history.len(), 1);
    }

    #[test]
    fn test_simulation_needs_selection() {
        let mut j = journal();
        add_factors(&mut j, &["A"]);
        let err = j.apply(
            JournalCommand::StartSimulation(SimRequest {
                iteration_count: 4,
                speed_ms: None,
                min_factors: 1,
                max_factors: 1,
                measurement_mode: MeasurementMode::RiskReward,
            }),
            Utc::now(),
        );
        assert!(matches!(err, Err(JournalError::Validation(_))));
        assert_eq!(j.simulation().state(), SimState::Idle);
    }

    fn sim_request(iteration_count: u32) -> JournalCommand {
        JournalCommand::StartSimulation(SimRequest {
            iteration_count: iteration_count.into(),
            speed_ms: Some(5),
            min_factors: 1,
            max_factors: 3,
            measurement_mode: MeasurementMode::RiskReward,
        })
    }

    fn active_epoch(j: &Journal<ManualScheduler>) -> u64 {
        j.simulation().scheduler().active.map(|(_, e)| e).expect("timer armed")
    }

    #[test]
    fn test_tick_snapshot_carries_no_archived_iterations() {
        let mut j = journal();
        add_factors(&mut j, &["A", "B", "C"]);
        apply(&mut j, JournalCommand::SelectAllFactors { selected: true });
        for _ in 0..2 {
            apply(&mut j, sim_request(6));
            let epoch = active_epoch(&j);
            for _ in 0..6 {
                j.on_tick(epoch, Utc::now());
            }
        }
        assert_eq!(j.simulation().history().len(), 2);

        apply(&mut j, sim_request(6));
        let (report, applied) = j.on_tick(active_epoch(&j), Utc::now());
        assert!(matches!(report, TickReport::Recorded { current: 1, total: 6 }));
        assert!(applied.dirty.is_empty(), "a recorded tick persists nothing");
        assert_eq!(applied.messages.len(), 1);
        assert!(matches!(applied.messages[0], WsMessage::SimulationProgress { current_iteration: 1, .. }));

        let snap = j.snapshot();
        assert_eq!(snap.simulation.history.len(), 2);
        assert!(snap.simulation.history.iter().all(|h| h.recorded == 6));
        let json = serde_json::to_value(&snap).unwrap();
        for entry in json["simulation"]["history"].as_array().unwrap() {
            assert!(entry.get("iterations").is_none());
        }

        let archived = &snap.simulation.history[0].id;
        let stats = j.simulation_session_stats(Some(archived)).unwrap();
        assert_eq!(stats.iter().map(|s| s.stats.total_count).sum::<u64>(), 6);
        let running = j.simulation_session_stats(None).unwrap();
        assert_eq!(running.iter().map(|s| s.stats.total_count).sum::<u64>(), 1);
        assert!(matches!(
            j.simulation_session_stats(Some("missing")),
            Err(JournalError::NotFound { kind: "simulation session", .. })
        ));
    }

    #[test]
    fn test_progress_refresh_keeps_history() {
        let mut j = journal();
        add_factors(&mut j, &["A"]);
        apply(&mut j, JournalCommand::SelectAllFactors { selected: true });
        apply(&mut j, sim_request(3));
        let mut view = j.snapshot().simulation;
        j.on_tick(active_epoch(&j), Utc::now());
        j.on_tick(active_epoch(&j), Utc::now());

        j.update_progress(&mut view);
        assert_eq!(view.current_iteration, 2);
        assert_eq!(view.state, SimState::Running);
        assert!(view.history.is_empty());
    }

    #[test]
    fn test_start_while_running_skips_validation() {
        let mut j = journal();
        add_factors(&mut j, &["A", "B"]);
        apply(&mut j, JournalCommand::SelectAllFactors { selected: true });
        apply(&mut j, sim_request(5));
        let epoch = active_epoch(&j);
        j.on_tick(epoch, Utc::now());

        apply(&mut j, JournalCommand::SelectAllFactors { selected: false });
        let bad = JournalCommand::StartSimulation(SimRequest {
            iteration_count: 0,
            speed_ms: None,
            min_factors: 4,
            max_factors: 1,
            measurement_mode: MeasurementMode::Dollar,
        });
        let applied = j.apply(bad.clone(), Utc::now()).expect("start during a run is ignored");
        assert!(applied.dirty.is_empty());
        assert!(matches!(
            applied.messages[0],
            WsMessage::SimulationProgress { state: SimState::Running, current_iteration: 1, iteration_count: 5 }
        ));
        assert_eq!(active_epoch(&j), epoch, "timer untouched");

        apply(&mut j, JournalCommand::PauseSimulation);
        assert!(j.apply(bad, Utc::now()).is_ok(), "paused runs ignore starts too");
        assert_eq!(j.simulation().state(), SimState::Paused);
        assert_eq!(j.simulation().iteration_count(), 5);
    }

    #[test]
    fn test_shutdown_archives_running_and_paused_runs() {
        let mut j = journal();
        add_factors(&mut j, &["A", "B"]);
        apply(&mut j, JournalCommand::SelectAllFactors { selected: true });
        apply(&mut j, sim_request(10));
        let epoch = active_epoch(&j);
        j.on_tick(epoch, Utc::now());
        j.on_tick(epoch, Utc::now());

        let applied = j.shutdown(Utc::now());
        assert_eq!(applied.dirty.as_slice(), &[StoreSection::SimulationSessions]);
        assert!(!j.simulation().scheduler().is_active());
        assert_eq!(j.simulation().history()[0].iterations.len(), 2);
        assert!(j.simulation().history()[0].end_time.is_some());

        let mut j = journal();
        add_factors(&mut j, &["A"]);
        apply(&mut j, JournalCommand::SelectAllFactors { selected: true });
        apply(&mut j, sim_request(10));
        j.on_tick(active_epoch(&j), Utc::now());
        apply(&mut j, JournalCommand::PauseSimulation);
        let cancels = j.simulation().scheduler().cancels;

        let applied = j.shutdown(Utc::now());
        assert_eq!(applied.dirty.as_slice(), &[StoreSection::SimulationSessions]);
        assert!(!j.simulation().scheduler().is_active());
        assert_eq!(j.simulation().scheduler().cancels, cancels, "paused run had no timer left");
        assert_eq!(j.simulation().history().len(), 1);

        assert!(j.shutdown(Utc::now()).dirty.is_empty(), "nothing left to archive");
    }

    #[test]
    fn test_sections_roundtrip() {
        let mut j = journal();
        let ids = add_factors(&mut j, &["A", "B"]);
        apply(&mut j, JournalCommand::StartTestSession { measurement_mode: MeasurementMode::Percent });
        apply(&mut j, test_trade(&[&ids[0]], TradeResult::Lose, 0.5));

        let sections: HashMap<String, String> = StoreSection::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), j.section_payload(*s).unwrap()))
            .collect();

        let mut restored = journal();
        restored.restore(&sections);
        assert_eq!(restored.factors, j.factors);
        assert_eq!(restored.test, j.test);
        assert_eq!(restored.snapshot().test.stats, j.snapshot().test.stats);
    }

    #[test]
    fn test_corrupt_section_falls_back_to_empty() {
        let mut j = journal();
        let mut sections = HashMap::new();
        sections.insert("factors".to_string(), "{not json".to_string());
        j.restore(&sections);
        assert!(j.factors.all().is_empty());
    }
}
