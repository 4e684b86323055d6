//! Deadline timer thread
//!
//! Serves sleep deadlines and cancellation deadlines of the tasks of one
//! processor. Registrations and withdrawals are pushed through an intrusive
//! MPSC queue and applied to an ordered map owned by the timer thread, which
//! parks until the earliest entry is due.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, Thread};
use std::time::Instant;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::deadline::Deadline;
use crate::queue::intrusive::{IntrusiveMpscQueue, MpscNode};
use crate::task::{Epoch, TaskContext, WakeupSource};

/// Identifies one registered entry; ordered by due time, then by
/// registration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey {
    at: Instant,
    seq: u64,
}

/// What happens when an entry fires
#[derive(Debug, Clone, Copy)]
enum TimerAction {
    /// Wake the sleep with this epoch
    Wakeup(Epoch),
    /// Cancel the task if its deadline generation still matches
    Cancel { generation: u64 },
}

struct TimerEntry {
    target: Weak<TaskContext>,
    action: TimerAction,
}

impl TimerEntry {
    fn fire(self) {
        let Some(context) = self.target.upgrade() else {
            return;
        };
        trace!(task_id = %context.id(), action = ?self.action, "timer fired");
        match self.action {
            TimerAction::Wakeup(epoch) => context.wakeup(WakeupSource::DeadlineTimer, epoch),
            TimerAction::Cancel { generation } => context.on_cancel_deadline(generation),
        }
    }
}

enum TimerCommand {
    Add(TimerKey, TimerEntry),
    Remove(TimerKey),
}

/// Entries owned by the timer thread
#[derive(Default)]
struct TimerEntries {
    entries: BTreeMap<TimerKey, TimerEntry>,
}

impl TimerEntries {
    fn apply(&mut self, command: TimerCommand) {
        match command {
            TimerCommand::Add(key, entry) => {
                self.entries.insert(key, entry);
            }
            // the entry may have fired already
            TimerCommand::Remove(key) => {
                self.entries.remove(&key);
            }
        }
    }

    fn pop_due(&mut self, now: Instant) -> Option<TimerEntry> {
        let (key, _) = self.entries.first_key_value()?;
        if key.at > now {
            return None;
        }
        self.entries.pop_first().map(|(_, entry)| entry)
    }

    fn next_due(&self) -> Option<Instant> {
        self.entries.first_key_value().map(|(key, _)| key.at)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Timer thread of one processor
pub(crate) struct TimerThread {
    incoming: IntrusiveMpscQueue<TimerCommand>,
    /// Set by the timer thread itself once it runs
    thread: OnceCell<Thread>,
    next_seq: AtomicU64,
    shutdown: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerThread {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            incoming: IntrusiveMpscQueue::new(),
            thread: OnceCell::new(),
            next_seq: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    /// Start the timer thread
    pub(crate) fn start(self: &Arc<Self>, name: String) -> io::Result<()> {
        let timer = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || timer.run_loop())?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop and join the timer thread. Pending entries are discarded.
    pub(crate) fn stop(&self) {
        self.shutdown.store(true, AtomicOrdering::SeqCst);
        self.notify();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Wake the sleep of `target` with `epoch` at `deadline`
    pub(crate) fn wakeup_at(
        &self,
        deadline: Deadline,
        target: Weak<TaskContext>,
        epoch: Epoch,
    ) -> Option<TimerKey> {
        self.register(deadline, target, TimerAction::Wakeup(epoch))
    }

    /// Cancel `target` at `deadline` unless its deadline changed meanwhile
    pub(crate) fn cancel_at(
        &self,
        deadline: Deadline,
        target: Weak<TaskContext>,
        generation: u64,
    ) -> Option<TimerKey> {
        self.register(deadline, target, TimerAction::Cancel { generation })
    }

    /// Drop an entry that is no longer needed. A no-op if it already fired.
    pub(crate) fn withdraw(&self, key: TimerKey) {
        self.incoming.push(MpscNode::new(TimerCommand::Remove(key)));
        self.notify();
    }

    fn register(
        &self,
        deadline: Deadline,
        target: Weak<TaskContext>,
        action: TimerAction,
    ) -> Option<TimerKey> {
        let at = deadline.instant()?;
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        let key = TimerKey { at, seq };
        self.incoming.push(MpscNode::new(TimerCommand::Add(
            key,
            TimerEntry { target, action },
        )));
        self.notify();
        Some(key)
    }

    fn notify(&self) {
        fence(AtomicOrdering::SeqCst);
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }

    fn run_loop(&self) {
        let _ = self.thread.set(thread::current());
        fence(AtomicOrdering::SeqCst);
        debug!("timer thread started");

        let mut entries = TimerEntries::default();
        loop {
            // SAFETY: the timer thread is the only consumer of `incoming`
            while let Some(command) = unsafe { self.incoming.try_pop_value() } {
                entries.apply(command);
            }
            if self.shutdown.load(AtomicOrdering::SeqCst) {
                break;
            }

            let now = Instant::now();
            while let Some(entry) = entries.pop_due(now) {
                entry.fire();
            }

            match entries.next_due() {
                Some(at) => thread::park_timeout(at.saturating_duration_since(Instant::now())),
                None => thread::park(),
            }
        }

        debug!(pending = entries.len(), "timer thread stopped");
    }
}

impl std::fmt::Debug for TimerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerThread")
            .field("registered", &self.next_seq.load(AtomicOrdering::Relaxed))
            .field("shutdown", &self.shutdown.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(at: Instant, seq: u64) -> TimerKey {
        TimerKey { at, seq }
    }

    fn entry() -> TimerEntry {
        TimerEntry {
            target: Weak::new(),
            action: TimerAction::Wakeup(Epoch(0)),
        }
    }

    #[test]
    fn test_entries_due_earliest_first() {
        let now = Instant::now();
        let mut entries = TimerEntries::default();
        entries.apply(TimerCommand::Add(key(now + Duration::from_millis(30), 0), entry()));
        entries.apply(TimerCommand::Add(key(now + Duration::from_millis(10), 1), entry()));
        entries.apply(TimerCommand::Add(key(now + Duration::from_millis(10), 2), entry()));
        entries.apply(TimerCommand::Add(key(now + Duration::from_millis(20), 3), entry()));
        let keys: Vec<u64> = entries.entries.keys().map(|key| key.seq).collect();
        assert_eq!(keys, vec![1, 2, 3, 0]);
        assert_eq!(entries.next_due(), Some(now + Duration::from_millis(10)));

        assert!(entries.pop_due(now).is_none());
        let later = now + Duration::from_millis(15);
        assert!(entries.pop_due(later).is_some());
        assert!(entries.pop_due(later).is_some());
        assert!(entries.pop_due(later).is_none());
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_withdrawn_entry_is_dropped() {
        let now = Instant::now();
        let mut entries = TimerEntries::default();
        let first = key(now + Duration::from_secs(60), 0);
        let second = key(now + Duration::from_secs(60), 1);
        entries.apply(TimerCommand::Add(first, entry()));
        entries.apply(TimerCommand::Add(second, entry()));
        entries.apply(TimerCommand::Remove(first));
        // removing an entry that already fired
        entries.apply(TimerCommand::Remove(first));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries.entries.keys().next(), Some(&second));
    }

    #[test]
    fn test_expired_target_ignored() {
        let timer = TimerThread::new();
        timer.start("test-timer".to_string()).unwrap();
        assert!(timer.wakeup_at(Deadline::passed(), Weak::new(), Epoch(3)).is_some());
        let key = timer.cancel_at(Deadline::from_duration(Duration::from_millis(5)), Weak::new(), 1);
        thread::sleep(Duration::from_millis(20));
        timer.withdraw(key.unwrap());
        timer.stop();
    }

    #[test]
    fn test_unreachable_deadline_not_registered() {
        let timer = TimerThread::new();
        assert!(timer.wakeup_at(Deadline::unreachable(), Weak::new(), Epoch(0)).is_none());
        // SAFETY: the timer thread was never started
        assert!(unsafe { timer.incoming.is_empty() });
        assert_eq!(timer.next_seq.load(AtomicOrdering::Relaxed), 0);
    }

    #[test]
    fn test_stop_before_start() {
        let timer = TimerThread::new();
        timer.stop();
    }
}
