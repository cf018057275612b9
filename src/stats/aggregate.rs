/// Per-model-key statistics.
/// All functions are pure -- they take records and return computed values.
/// `StatsBook` is the single fold used both for full recomputation and for
/// the simulation's incremental updates, so the two always agree.

use crate::journal::types::{Iteration, LiveTrade, MeasurementMode, TestTrade, TradeResult};
use crate::stats::key::ModelKey;
use std::collections::BTreeMap;

/// Name shown for a key part whose factor or model no longer exists.
pub const DELETED_FACTOR: &str = "(deleted factor)";
pub const DELETED_MODEL: &str = "(deleted model)";

/// A record that can be folded into a stats bucket.
pub trait StatsRecord {
    /// Outcome and non-negative magnitude. `None` for records that only count
    /// toward frequency (simulation draws).
    fn outcome(&self, mode: MeasurementMode) -> Option<(TradeResult, f64)>;
}

impl StatsRecord for TestTrade {
    fn outcome(&self, _mode: MeasurementMode) -> Option<(TradeResult, f64)> {
        Some((self.result, self.measurement_value))
    }
}

impl StatsRecord for LiveTrade {
    fn outcome(&self, mode: MeasurementMode) -> Option<(TradeResult, f64)> {
        Some((self.result, self.realized_value(mode)))
    }
}

impl StatsRecord for Iteration {
    fn outcome(&self, _mode: MeasurementMode) -> Option<(TradeResult, f64)> {
        None
    }
}

/// Resolves display names for a key at call time. Must never fail: unknown
/// parts resolve to a placeholder.
pub trait NameResolver {
    fn factor_names(&self, key: &ModelKey) -> Vec<String>;

    fn label(&self, key: &ModelKey) -> String {
        self.factor_names(key).join(" + ")
    }
}

/// Resolver for keys whose parts already are display names (simulation keys).
pub struct KeyParts;

impl NameResolver for KeyParts {
    fn factor_names(&self, key: &ModelKey) -> Vec<String> {
        key.parts().map(str::to_string).collect()
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ModelStats {
    pub model_key: ModelKey,
    pub label: String,
    pub factor_names: Vec<String>,
    pub total_count: u64,
    pub wins: u64,
    pub losses: u64,
    /// Percent in [0, 100]; 0 when `total_count == 0`.
    pub win_rate: f64,
    /// `win_value - loss_value`
    pub total_value: f64,
    pub win_value: f64,
    pub loss_value: f64,
    pub expectancy: f64,
    /// Average win over average loss. `None` without both wins and losses.
    pub realized_rr: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Tally {
    total_count: u64,
    wins: u64,
    losses: u64,
    win_value: f64,
    loss_value: f64,
}

impl Tally {
    fn add(&mut self, outcome: Option<(TradeResult, f64)>) {
        self.total_count += 1;
        let Some((result, value)) = outcome else {
            return;
        };
        let value = if value.is_finite() { value.max(0.0) } else { 0.0 };
        match result {
            TradeResult::Win => {
                self.wins += 1;
                self.win_value += value;
            }
            TradeResult::Lose => {
                self.losses += 1;
                self.loss_value += value;
            }
        }
    }

    fn into_stats(self, model_key: ModelKey, resolver: &dyn NameResolver) -> ModelStats {
        let avg_win = if self.wins == 0 { 0.0 } else { self.win_value / self.wins as f64 };
        let avg_loss = if self.losses == 0 { 0.0 } else { self.loss_value / self.losses as f64 };
        let (win_frac, loss_frac) = if self.total_count == 0 {
            (0.0, 0.0)
        } else {
            let n = self.total_count as f64;
            (self.wins as f64 / n, self.losses as f64 / n)
        };
        let realized_rr = (self.wins > 0 && self.losses > 0 && avg_loss > 0.0).then(|| avg_win / avg_loss);

        ModelStats {
            label: resolver.label(&model_key),
            factor_names: resolver.factor_names(&model_key),
            model_key,
            total_count: self.total_count,
            wins: self.wins,
            losses: self.losses,
            win_rate: win_rate(self.wins, self.total_count),
            total_value: self.win_value - self.loss_value,
            win_value: self.win_value,
            loss_value: self.loss_value,
            expectancy: win_frac * avg_win - loss_frac * avg_loss,
            realized_rr,
        }
    }
}

#[inline]
pub fn win_rate(wins: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    wins as f64 / total as f64 * 100.0
}

/// Running per-key tallies. Buckets are kept in key order so the output of
/// [`StatsBook::finish`] is deterministic for a given record multiset.
#[derive(Debug, Clone, Default)]
pub struct StatsBook {
    buckets: BTreeMap<ModelKey, Tally>,
}

impl StatsBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, key: ModelKey, outcome: Option<(TradeResult, f64)>) {
        self.buckets.entry(key).or_default().add(outcome);
    }

    /// Resolve names against the current tables and emit one entry per key.
    pub fn finish(&self, resolver: &dyn NameResolver) -> Vec<ModelStats> {
        self.buckets
            .iter()
            .map(|(key, tally)| tally.into_stats(key.clone(), resolver))
            .collect()
    }
}

/// Fold `records` into per-key stats from scratch. Total: empty input yields
/// an empty list.
pub fn aggregate<R, K>(
    records: &[R],
    mode: MeasurementMode,
    key_of: K,
    resolver: &dyn NameResolver,
) -> Vec<ModelStats>
where
    R: StatsRecord,
    K: Fn(&R) -> ModelKey,
{
    let mut book = StatsBook::new();
    for record in records {
        book.record(key_of(record), record.outcome(mode));
    }
    book.finish(resolver)
}

// ── Presentation helpers ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsOrder {
    #[default]
    WinRate,
    TradeCount,
    TotalValue,
}

/// Descending by the chosen measure. Ties fall back to trade count and
/// then to the key so equal inputs always render identically.
pub fn compare_stats(a: &ModelStats, b: &ModelStats, order: StatsOrder) -> std::cmp::Ordering {
    let primary = match order {
        StatsOrder::WinRate => b.win_rate.total_cmp(&a.win_rate),
        StatsOrder::TradeCount => b.total_count.cmp(&a.total_count),
        StatsOrder::TotalValue => b.total_value.total_cmp(&a.total_value),
    };
    primary
        .then_with(|| b.total_count.cmp(&a.total_count))
        .then_with(|| a.model_key.cmp(&b.model_key))
}

pub fn sort_stats(stats: &mut [ModelStats], order: StatsOrder) {
    stats.sort_by(|a, b| compare_stats(a, b, order));
}

/// Percentage of all `total` records that landed in this bucket.
#[inline]
pub fn frequency_share(stats: &ModelStats, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    stats.total_count as f64 / total as f64 * 100.0
}

/// Whole-session totals, independent of model keys.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct SessionSummary {
    pub total_count: u64,
    pub wins: u64,
    pub losses: u64,
    pub win_rate: f64,
    pub net_value: f64,
}

pub fn summarize<R: StatsRecord>(records: &[R], mode: MeasurementMode) -> SessionSummary {
    let mut tally = Tally::default();
    for record in records {
        tally.add(record.outcome(mode));
    }
    SessionSummary {
        total_count: tally.total_count,
        wins: tally.wins,
        losses: tally.losses,
        win_rate: win_rate(tally.wins, tally.total_count),
        net_value: tally.win_value - tally.loss_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::key::derive_key;
    use chrono::Utc;

    struct Names;

    impl NameResolver for Names {
        fn factor_names(&self, key: &ModelKey) -> Vec<String> {
            key.parts()
                .map(|id| match id {
                    "A" => "Trend".to_string(),
                    "B" => "Volume".to_string(),
                    _ => DELETED_FACTOR.to_string(),
                })
                .collect()
        }
    }

    fn trade(ids: &[&str], result: TradeResult, value: f64) -> TestTrade {
        TestTrade {
            id: crate::journal::types::new_id(),
            timestamp: Utc::now(),
            factor_ids: ids.iter().map(|s| s.to_string()).collect(),
            measurement_value: value,
            result,
            notes: None,
            images: Vec::new(),
        }
    }

    fn by_ids(t: &TestTrade) -> ModelKey {
        derive_key(&t.factor_ids)
    }

    fn run(trades: &[TestTrade]) -> Vec<ModelStats> {
        aggregate(trades, MeasurementMode::RiskReward, by_ids, &Names)
    }

    #[test]
    fn test_permuted_factors_share_bucket() {
        let trades = vec![
            trade(&["A", "B"], TradeResult::Win, 2.0),
            trade(&["B", "A"], TradeResult::Lose, 1.0),
        ];
        let stats = run(&trades);
        assert_eq!(stats.len(), 1, "{{A,B}} and {{B,A}} must share a bucket");
        let s = &stats[0];
        assert_eq!(s.total_count, 2);
        assert_eq!(s.wins, 1);
        assert_eq!(s.losses, 1);
        assert!((s.win_rate - 50.0).abs() < 1e-12);
        assert!((s.total_value - 1.0).abs() < 1e-12, "win 2 minus loss 1");
        assert_eq!(s.factor_names, vec!["Trend", "Volume"]);
        assert_eq!(s.label, "Trend + Volume");
    }

    #[test]
    fn test_empty_input_is_empty() {
        assert!(run(&[]).is_empty());
        let summary = summarize::<TestTrade>(&[], MeasurementMode::Dollar);
        assert_eq!(summary, SessionSummary::default());
    }

    #[test]
    fn test_win_rate_zero_total() {
        assert_eq!(win_rate(0, 0), 0.0);
        assert_eq!(win_rate(3, 4), 75.0);
    }

    #[test]
    fn test_additive_and_commutative() {
        let a = vec![
            trade(&["A"], TradeResult::Win, 1.0),
            trade(&["A", "B"], TradeResult::Lose, 1.0),
            trade(&["A"], TradeResult::Lose, 0.5),
        ];
        let b = vec![
            trade(&["B", "A"], TradeResult::Win, 3.0),
            trade(&["A"], TradeResult::Win, 2.0),
        ];
        let ab: Vec<_> = a.iter().chain(b.iter()).cloned().collect();
        let ba: Vec<_> = b.iter().chain(a.iter()).cloned().collect();

        let sa = run(&a);
        let sb = run(&b);
        let sab = run(&ab);
        assert_eq!(sab, run(&ba), "aggregation must not depend on record order");

        for entry in &sab {
            let count = |list: &[ModelStats]| {
                list.iter()
                    .find(|s| s.model_key == entry.model_key)
                    .map(|s| (s.total_count, s.wins))
                    .unwrap_or((0, 0))
            };
            let (ca, wa) = count(&sa);
            let (cb, wb) = count(&sb);
            assert_eq!(entry.total_count, ca + cb);
            assert_eq!(entry.wins, wa + wb);
        }
    }

    #[test]
    fn test_win_rate_bounds() {
        let trades = vec![
            trade(&["A"], TradeResult::Win, 1.0),
            trade(&["A"], TradeResult::Win, 1.0),
            trade(&["B"], TradeResult::Lose, 1.0),
        ];
        for s in run(&trades) {
            assert!((0.0..=100.0).contains(&s.win_rate), "win rate out of range: {}", s.win_rate);
        }
    }

    #[test]
    fn test_deleted_factor_uses_placeholder() {
        let stats = run(&[trade(&["A", "gone"], TradeResult::Win, 1.0)]);
        assert_eq!(stats[0].factor_names, vec!["Trend", DELETED_FACTOR]);
    }

    #[test]
    fn test_expectancy_and_rr() {
        let trades = vec![
            trade(&["A"], TradeResult::Win, 3.0),
            trade(&["A"], TradeResult::Win, 1.0),
            trade(&["A"], TradeResult::Lose, 1.0),
            trade(&["A"], TradeResult::Lose, 1.0),
        ];
        let s = &run(&trades)[0];
        // 0.5 * 2.0 - 0.5 * 1.0
        assert!((s.expectancy - 0.5).abs() < 1e-12, "expectancy: {}", s.expectancy);
        assert_eq!(s.realized_rr, Some(2.0));

        let only_wins = run(&[trade(&["A"], TradeResult::Win, 1.0)]);
        assert_eq!(only_wins[0].realized_rr, None);
    }

    #[test]
    fn test_iterations_only_count() {
        let iters = vec![
            Iteration { selected_factor_ids: vec!["1".into()], model_key: derive_key(&["Trend"]) },
            Iteration { selected_factor_ids: vec!["1".into()], model_key: derive_key(&["Trend"]) },
            Iteration { selected_factor_ids: vec!["2".into()], model_key: derive_key(&["Volume"]) },
        ];
        let stats = aggregate(&iters, MeasurementMode::RiskReward, |i: &Iteration| i.model_key.clone(), &KeyParts);
        assert_eq!(stats.len(), 2);
        let trend = stats.iter().find(|s| s.label == "Trend").unwrap();
        assert_eq!(trend.total_count, 2);
        assert_eq!(trend.wins + trend.losses, 0);
        assert_eq!(trend.win_rate, 0.0);
        assert!((frequency_share(trend, 3) - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_incremental_matches_full() {
        let trades = vec![
            trade(&["A", "B"], TradeResult::Win, 2.0),
            trade(&["A"], TradeResult::Lose, 1.0),
            trade(&["B", "A"], TradeResult::Win, 1.5),
        ];
        let mut book = StatsBook::new();
        for t in &trades {
            book.record(by_ids(t), t.outcome(MeasurementMode::RiskReward));
        }
        assert_eq!(book.finish(&Names), run(&trades));
    }

    #[test]
    fn test_sort_orders() {
        let trades = vec![
            trade(&["A"], TradeResult::Win, 5.0),
            trade(&["B"], TradeResult::Win, 1.0),
            trade(&["B"], TradeResult::Lose, 1.0),
            trade(&["B"], TradeResult::Win, 1.0),
        ];
        let mut stats = run(&trades);

        sort_stats(&mut stats, StatsOrder::WinRate);
        assert_eq!(stats[0].model_key.as_str(), "A");

        sort_stats(&mut stats, StatsOrder::TradeCount);
        assert_eq!(stats[0].model_key.as_str(), "B");

        sort_stats(&mut stats, StatsOrder::TotalValue);
        assert_eq!(stats[0].model_key.as_str(), "A");
    }

    #[test]
    fn test_summary_totals() {
        let trades = vec![
            trade(&["A"], TradeResult::Win, 2.0),
            trade(&["B"], TradeResult::Lose, 0.5),
            trade(&["A", "B"], TradeResult::Win, 1.0),
        ];
        let s = summarize(&trades, MeasurementMode::RiskReward);
        assert_eq!(s.total_count, 3);
        assert_eq!(s.wins, 2);
        assert_eq!(s.losses, 1);
        assert!((s.net_value - 2.5).abs() < 1e-12);
    }
}
