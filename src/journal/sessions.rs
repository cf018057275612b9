/// Session lifecycle for the two trade-bearing modes.
///
/// Test mode keeps every session addressable in one list and lets a new
/// session coexist with older ones by swapping the current pointer. Live mode
/// has at most one active session and a capped, most-recent-first history.
/// Both discard a session that ends with zero trades.

use crate::errors::{JournalError, JournalResult};
use crate::journal::types::{
    new_id, LiveSession, LiveTrade, MeasurementMode, TestSession, TestTrade,
};
use chrono::{DateTime, Utc};

pub const DEFAULT_LIVE_HISTORY_CAP: usize = 100;

/// What happened when a session was ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Zero records: dropped without a history entry.
    Discarded { id: String },
    /// Frozen with `end_time` and retained.
    Archived { id: String, records: usize },
}

/// Prepend `session` to a most-recent-first history and evict past `cap`.
pub fn retire<S>(history: &mut Vec<S>, session: S, cap: usize) {
    history.insert(0, session);
    history.truncate(cap);
}

/// Mutable annotations of an otherwise immutable trade.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
pub struct TradePatch {
    /// Empty string clears the notes.
    pub notes: Option<String>,
    pub images: Option<Vec<String>>,
}

pub trait Annotated {
    fn trade_id(&self) -> &str;
    fn notes_mut(&mut self) -> &mut Option<String>;
    fn images_mut(&mut self) -> &mut Vec<String>;

    fn apply(&mut self, patch: &TradePatch) {
        if let Some(notes) = &patch.notes {
            let trimmed = notes.trim();
            *self.notes_mut() = (!trimmed.is_empty()).then(|| trimmed.to_string());
        }
        if let Some(images) = &patch.images {
            *self.images_mut() = images.clone();
        }
    }
}

impl Annotated for TestTrade {
    fn trade_id(&self) -> &str {
        &self.id
    }
    fn notes_mut(&mut self) -> &mut Option<String> {
        &mut self.notes
    }
    fn images_mut(&mut self) -> &mut Vec<String> {
        &mut self.images
    }
}

impl Annotated for LiveTrade {
    fn trade_id(&self) -> &str {
        &self.id
    }
    fn notes_mut(&mut self) -> &mut Option<String> {
        &mut self.notes
    }
    fn images_mut(&mut self) -> &mut Vec<String> {
        &mut self.images
    }
}

fn patch_in<T: Annotated>(trades: &mut [T], trade_id: &str, patch: &TradePatch) -> bool {
    match trades.iter_mut().find(|t| t.trade_id() == trade_id) {
        Some(t) => {
            t.apply(patch);
            true
        }
        None => false,
    }
}

fn remove_in<T: Annotated>(trades: &mut Vec<T>, trade_id: &str) -> bool {
    let before = trades.len();
    trades.retain(|t| t.trade_id() != trade_id);
    trades.len() != before
}

// ── Test mode ──

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TestSessions {
    /// Most recent first. Ended sessions stay here.
    sessions: Vec<TestSession>,
    current_id: Option<String>,
}

impl TestSessions {
    pub fn sessions(&self) -> &[TestSession] {
        &self.sessions
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current_id.as_deref()
    }

    pub fn current(&self) -> Option<&TestSession> {
        let id = self.current_id.as_deref()?;
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&TestSession> {
        self.sessions.iter().find(|s| s.id == id)
    }

    /// Create a new session and make it current. Older sessions, active or
    /// not, stay in the list.
    pub fn start(&mut self, mode: MeasurementMode, now: DateTime<Utc>) -> &TestSession {
        let session = TestSession {
            id: new_id(),
            start_time: now,
            end_time: None,
            measurement_mode: mode,
            trades: Vec::new(),
        };
        tracing::info!(session_id = %session.id, mode = %mode, "test session started");
        self.current_id = Some(session.id.clone());
        self.sessions.insert(0, session);
        &self.sessions[0]
    }

    pub fn select(&mut self, id: &str) -> JournalResult<()> {
        if self.get(id).is_none() {
            return Err(JournalError::not_found("test session", id));
        }
        self.current_id = Some(id.to_string());
        Ok(())
    }

    fn active_mut(&mut self) -> JournalResult<&mut TestSession> {
        let id = self
            .current_id
            .as_deref()
            .ok_or(JournalError::NoActiveSession("test"))?;
        self.sessions
            .iter_mut()
            .find(|s| s.id == id && s.end_time.is_none())
            .ok_or(JournalError::NoActiveSession("test"))
    }

    /// Append to the current session. Test mode never starts one implicitly.
    pub fn add_trade(&mut self, trade: TestTrade) -> JournalResult<()> {
        let session = self.active_mut()?;
        session.trades.push(trade);
        Ok(())
    }

    pub fn end(&mut self, now: DateTime<Utc>) -> JournalResult<SessionEnd> {
        let session = self.active_mut()?;
        let id = session.id.clone();
        if session.trades.is_empty() {
            self.sessions.retain(|s| s.id != id);
            self.current_id = None;
            tracing::info!(session_id = %id, "empty test session discarded");
            return Ok(SessionEnd::Discarded { id });
        }
        session.end_time = Some(now);
        let records = session.trades.len();
        tracing::info!(session_id = %id, trades = records, "test session ended");
        Ok(SessionEnd::Archived { id, records })
    }

    pub fn delete(&mut self, id: &str) -> JournalResult<()> {
        let before = self.sessions.len();
        self.sessions.retain(|s| s.id != id);
        if self.sessions.len() == before {
            return Err(JournalError::not_found("test session", id));
        }
        if self.current_id.as_deref() == Some(id) {
            self.current_id = None;
        }
        Ok(())
    }

    pub fn patch_trade(&mut self, trade_id: &str, patch: &TradePatch) -> JournalResult<()> {
        let found = self
            .sessions
            .iter_mut()
            .any(|s| patch_in(&mut s.trades, trade_id, patch));
        if found { Ok(()) } else { Err(JournalError::not_found("trade", trade_id)) }
    }

    pub fn delete_trade(&mut self, trade_id: &str) -> JournalResult<()> {
        let found = self
            .sessions
            .iter_mut()
            .any(|s| remove_in(&mut s.trades, trade_id));
        if found { Ok(()) } else { Err(JournalError::not_found("trade", trade_id)) }
    }
}

// ── Live mode ──

fn default_live_cap() -> usize {
    DEFAULT_LIVE_HISTORY_CAP
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LiveSessions {
    current: Option<LiveSession>,
    /// Most recent first, at most `cap` entries.
    history: Vec<LiveSession>,
    #[serde(skip, default = "default_live_cap")]
    cap: usize,
}

impl Default for LiveSessions {
    fn default() -> Self {
        Self::with_cap(DEFAULT_LIVE_HISTORY_CAP)
    }
}

impl LiveSessions {
    pub fn with_cap(cap: usize) -> Self {
        Self { current: None, history: Vec::new(), cap: cap.max(1) }
    }

    /// Apply a configured cap, evicting anything already past it.
    pub fn set_cap(&mut self, cap: usize) {
        self.cap = cap.max(1);
        self.history.truncate(self.cap);
    }

    pub fn current(&self) -> Option<&LiveSession> {
        self.current.as_ref()
    }

    pub fn history(&self) -> &[LiveSession] {
        &self.history
    }

    pub fn start(&mut self, mode: MeasurementMode, now: DateTime<Utc>) -> JournalResult<&LiveSession> {
        if self.current.is_some() {
            return Err(JournalError::SessionActive("live"));
        }
        let session = LiveSession {
            id: new_id(),
            start_time: now,
            end_time: None,
            measurement_mode: mode,
            trades: Vec::new(),
        };
        tracing::info!(session_id = %session.id, mode = %mode, "live session started");
        Ok(&*self.current.insert(session))
    }

    /// Append to the active session, starting one in `mode` if none is active.
    /// Returns true when a session was started.
    pub fn add_trade(&mut self, trade: LiveTrade, mode: MeasurementMode, now: DateTime<Utc>) -> bool {
        let started = self.current.is_none();
        if started {
            tracing::info!(mode = %mode, "no active live session, starting one for trade");
        }
        let session = self.current.get_or_insert_with(|| LiveSession {
            id: new_id(),
            start_time: now,
            end_time: None,
            measurement_mode: mode,
            trades: Vec::new(),
        });
        session.trades.push(trade);
        started
    }

    pub fn end(&mut self, now: DateTime<Utc>) -> JournalResult<SessionEnd> {
        let mut session = self.current.take().ok_or(JournalError::NoActiveSession("live"))?;
        let id = session.id.clone();
        if session.trades.is_empty() {
            tracing::info!(session_id = %id, "empty live session discarded");
            return Ok(SessionEnd::Discarded { id });
        }
        session.end_time = Some(now);
        let records = session.trades.len();
        retire(&mut self.history, session, self.cap);
        tracing::info!(session_id = %id, trades = records, history = self.history.len(), "live session ended");
        Ok(SessionEnd::Archived { id, records })
    }

    pub fn delete(&mut self, id: &str) -> JournalResult<()> {
        let before = self.history.len();
        self.history.retain(|s| s.id != id);
        if self.history.len() == before {
            return Err(JournalError::not_found("live session", id));
        }
        Ok(())
    }

    fn all_mut(&mut self) -> impl Iterator<Item = &mut LiveSession> {
        self.current.iter_mut().chain(self.history.iter_mut())
    }

    pub fn patch_trade(&mut self, trade_id: &str, patch: &TradePatch) -> JournalResult<()> {
        let found = self.all_mut().any(|s| patch_in(&mut s.trades, trade_id, patch));
        if found { Ok(()) } else { Err(JournalError::not_found("trade", trade_id)) }
    }

    pub fn delete_trade(&mut self, trade_id: &str) -> JournalResult<()> {
        let found = self.all_mut().any(|s| remove_in(&mut s.trades, trade_id));
        if found { Ok(()) } else { Err(JournalError::not_found("trade", trade_id)) }
    }
}
