//! Named one-shot timers on the tokio clock
//!
//! A fired timer is delivered as a message on the driver queue, tagged with
//! the generation it was started under and a token unique to this start.
//! Cancelling aborts the sleeping task and forgets the token, so a fire that
//! was already queued before the cancel is rejected by [`TimerSet::accept`].

use std::collections::HashMap;
use std::time::Duration;
use switchback_shared::state_machine::{Generation, TimerKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Fire notification for one started timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub timer: TimerKind,
    pub generation: Generation,
    pub token: u64,
}

struct Slot {
    generation: Generation,
    token: u64,
    task: JoinHandle<()>,
}

pub struct TimerSet<M> {
    tx: mpsc::UnboundedSender<M>,
    slots: HashMap<TimerKind, Slot>,
    next_token: u64,
}

impl<M> TimerSet<M>
where
    M: From<TimerFired> + Send + 'static,
{
    pub fn new(tx: mpsc::UnboundedSender<M>) -> Self {
        Self {
            tx,
            slots: HashMap::new(),
            next_token: 0,
        }
    }

    /// Arm `timer`, replacing any live timer of the same kind
    pub fn start(&mut self, timer: TimerKind, generation: Generation, after: Duration) {
        self.cancel(timer);

        self.next_token += 1;
        let fired = TimerFired {
            timer,
            generation,
            token: self.next_token,
        };
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(M::from(fired));
        });

        trace!("timer {:?} armed for {:?} (gen {})", timer, after, generation);
        self.slots.insert(
            timer,
            Slot {
                generation,
                token: fired.token,
                task,
            },
        );
    }

    /// Returns whether a live timer was cancelled
    pub fn cancel(&mut self, timer: TimerKind) -> bool {
        match self.slots.remove(&timer) {
            Some(slot) => {
                slot.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, slot) in self.slots.drain() {
            slot.task.abort();
        }
    }

    /// Claim a fire. Only the fire of the currently live start is accepted,
    /// and accepting it retires the slot.
    pub fn accept(&mut self, fired: &TimerFired) -> bool {
        let live = matches!(
            self.slots.get(&fired.timer),
            Some(slot) if slot.token == fired.token && slot.generation == fired.generation
        );
        if live {
            self.slots.remove(&fired.timer);
        }
        live
    }

    pub fn live_count(&self) -> usize {
        self.slots.len()
    }
}

impl<M> Drop for TimerSet<M> {
    fn drop(&mut self) {
        for (_, slot) in self.slots.drain() {
            slot.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timers() -> (TimerSet<TimerFired>, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TimerSet::new(tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let (mut set, mut rx) = timers();
        set.start(TimerKind::UpgradeDelay, 1, Duration::from_millis(1000));

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert!(rx.try_recv().is_err());

        let fired = rx.recv().await.expect("timer never fired");
        assert_eq!(fired.timer, TimerKind::UpgradeDelay);
        assert_eq!(fired.generation, 1);
        assert!(set.accept(&fired));
        assert_eq!(set.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let (mut set, mut rx) = timers();
        set.start(TimerKind::UpgradeConfirm, 3, Duration::from_millis(10));

        assert!(set.cancel(TimerKind::UpgradeConfirm));
        assert!(!set.cancel(TimerKind::UpgradeConfirm));
        assert_eq!(set.live_count(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_previous_timer() {
        let (mut set, mut rx) = timers();
        set.start(TimerKind::ReconnectBackoff, 1, Duration::from_millis(10));
        set.start(TimerKind::ReconnectBackoff, 2, Duration::from_millis(20));
        assert_eq!(set.live_count(), 1);

        let fired = rx.recv().await.expect("timer never fired");
        assert_eq!(fired.generation, 2);
        assert!(set.accept(&fired));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_fire_rejected_after_cancel() {
        let (mut set, mut rx) = timers();
        set.start(TimerKind::UpgradeDelay, 1, Duration::from_millis(10));

        // The fire lands in the queue before the owner gets to it
        tokio::time::sleep(Duration::from_millis(20)).await;
        set.cancel(TimerKind::UpgradeDelay);

        let fired = rx.recv().await.expect("fire should be queued");
        assert!(!set.accept(&fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_aborts_timers() {
        let (mut set, mut rx) = timers();
        set.start(TimerKind::UpgradeDelay, 1, Duration::from_millis(10));
        set.start(TimerKind::UpgradeConfirm, 1, Duration::from_millis(10));
        drop(set);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.recv().await.is_none());
    }
}
