use crate::state::JournalEvent;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// A cancellable repeating task. At most one timer is live per scheduler;
/// scheduling again replaces it. Every tick carries the epoch it was
/// scheduled with so the receiver can drop ticks from a replaced timer.
pub trait TickScheduler {
    fn schedule(&mut self, every: Duration, epoch: u64);
    fn cancel(&mut self);
    fn is_active(&self) -> bool;
}

/// Tokio interval feeding `SimTick` events into the journal channel.
pub struct IntervalScheduler {
    tx: mpsc::Sender<JournalEvent>,
    handle: Option<JoinHandle<()>>,
}

impl IntervalScheduler {
    pub fn new(tx: mpsc::Sender<JournalEvent>) -> Self {
        Self { tx, handle: None }
    }
}

impl TickScheduler for IntervalScheduler {
    fn schedule(&mut self, every: Duration, epoch: u64) {
        self.cancel();
        let tx = self.tx.clone();
        self.handle = Some(tokio::spawn(async move {
            // First tick one period out, not immediately.
            let mut interval = tokio::time::interval_at(Instant::now() + every, every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if tx.send(JournalEvent::SimTick { epoch }).await.is_err() {
                    tracing::debug!(epoch, "journal channel closed, simulation timer exiting");
                    break;
                }
            }
        }));
        tracing::debug!(epoch, every_ms = every.as_millis() as u64, "simulation timer scheduled");
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            tracing::debug!("simulation timer cancelled");
        }
    }

    fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for IntervalScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// In-memory scheduler for driving ticks by hand.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct ManualScheduler {
    pub active: Option<(Duration, u64)>,
    pub schedules: usize,
    pub cancels: usize,
}

#[cfg(test)]
impl TickScheduler for ManualScheduler {
    fn schedule(&mut self, every: Duration, epoch: u64) {
        self.schedules += 1;
        self.active = Some((every, epoch));
    }

    fn cancel(&mut self) {
        if self.active.take().is_some() {
            self.cancels += 1;
        }
    }

    fn is_active(&self) -> bool {
        self.active.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    #[tokio::test]
    async fn test_interval_emits_epoch() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut sched = IntervalScheduler::new(tx);
        sched.schedule(Duration::from_millis(5), 3);
        assert!(sched.is_active());

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("tick within timeout")
            .expect("channel open");
        assert!(matches!(event, JournalEvent::SimTick { epoch: 3 }));
        sched.cancel();
        assert!(!sched.is_active());
    }

    #[tokio::test]
    async fn test_cancel_stops_ticks() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut sched = IntervalScheduler::new(tx);
        sched.schedule(Duration::from_millis(5), 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        sched.cancel();

        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(
            matches!(rx.try_recv(), Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected)),
            "no ticks after cancel"
        );
    }

    #[tokio::test]
    async fn test_reschedule_replaces_timer() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut sched = IntervalScheduler::new(tx);
        sched.schedule(Duration::from_millis(5), 1);
        sched.schedule(Duration::from_millis(5), 2);

        for _ in 0..5 {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("tick within timeout")
                .expect("channel open");
            assert!(matches!(event, JournalEvent::SimTick { epoch: 2 }), "only the newest timer ticks");
        }
    }

    #[tokio::test]
    async fn test_drop_stops_ticks() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut sched = IntervalScheduler::new(tx);
        sched.schedule(Duration::from_millis(5), 7);
        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("tick within timeout");
        assert!(matches!(first, Some(JournalEvent::SimTick { epoch: 7 })));

        drop(sched);
        while rx.try_recv().is_ok() {}
        // The aborted task releases the last sender, so the channel closes.
        let after = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(!matches!(after, Ok(Some(_))), "no ticks after the scheduler is dropped");
    }

    #[test]
    fn test_manual_scheduler_tracks_single_timer() {
        let mut sched = ManualScheduler::default();
        sched.schedule(Duration::from_millis(10), 1);
        sched.schedule(Duration::from_millis(10), 2);
        assert_eq!(sched.active, Some((Duration::from_millis(10), 2)));
        sched.cancel();
        sched.cancel();
        assert_eq!(sched.cancels, 1);
        assert!(!sched.is_active());
    }
}
