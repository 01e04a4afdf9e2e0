//! A table of promises waiting on a log entry to be committed and applied.
//!
//! This is the standalone, independently testable counterpart to the `awaiting_committed` buffer
//! threaded through [`crate::core`]'s leader loop: register a waiter for a log index, then notify
//! it once that index has been applied to the state machine, or reject the whole table when
//! leadership changes out from under it.

use std::collections::BTreeMap;
use std::time::Duration;
use std::time::Instant;

/// The reason a waiter was rejected without ever being fulfilled.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CommitWaitError {
    /// The node lost leadership (or the term changed) before the entry committed.
    #[error("leadership lost: term changed from {old_term} to {new_term}")]
    LeadershipLost { old_term: u64, new_term: u64 },

    /// The waiter's deadline elapsed before the entry was applied.
    #[error("timed out waiting for commit")]
    Timeout,

    /// The table was torn down for a reason other than a leadership change (e.g. shutdown).
    #[error("aborted: {0}")]
    Aborted(String),
}

struct Waiter<T> {
    fulfil: Box<dyn FnOnce(T) + Send>,
    reject: Box<dyn FnOnce(CommitWaitError) + Send>,
    deadline: Instant,
    term: u64,
}

/// A table mapping log indexes to the promises waiting on them.
///
/// `T` is whatever value a waiter is ultimately fulfilled with, typically the application-level
/// response produced by applying the corresponding entry to the state machine.
pub struct CommitWaiter<T> {
    waiters: BTreeMap<u64, Waiter<T>>,
}

impl<T> Default for CommitWaiter<T> {
    fn default() -> Self {
        Self {
            waiters: BTreeMap::new(),
        }
    }
}

impl<T> CommitWaiter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `index`, associated with the leadership `term` under which the
    /// entry was appended. Only one waiter may be registered per index at a time.
    pub fn register(
        &mut self,
        index: u64,
        term: u64,
        timeout: Duration,
        fulfil: impl FnOnce(T) + Send + 'static,
        reject: impl FnOnce(CommitWaitError) + Send + 'static,
    ) {
        debug_assert!(!self.waiters.contains_key(&index), "duplicate commit waiter for index {}", index);
        self.waiters.insert(
            index,
            Waiter {
                fulfil: Box::new(fulfil),
                reject: Box::new(reject),
                deadline: Instant::now() + timeout,
                term,
            },
        );
    }

    /// Notify the waiter at `index`, if any, that its entry has been applied. `produce` is called
    /// to materialize the value to fulfil the waiter with; if it fails, the waiter is rejected
    /// instead.
    pub fn notify_applied<E>(&mut self, index: u64, produce: impl FnOnce(u64) -> Result<T, E>)
    where E: std::fmt::Display {
        if let Some(waiter) = self.waiters.remove(&index) {
            match produce(index) {
                Ok(value) => (waiter.fulfil)(value),
                Err(err) => (waiter.reject)(CommitWaitError::Aborted(err.to_string())),
            }
        }
    }

    /// Reject every waiter registered under a term older than `new_term`, and clear the table.
    ///
    /// Waiters registered under `new_term` itself (e.g. by a leader which just regained its own
    /// leadership in the same term, which cannot happen in Raft, but is harmless to allow) are
    /// left untouched.
    pub fn cancel_on_leadership_loss(&mut self, old_term: u64, new_term: u64) {
        let stale: Vec<u64> =
            self.waiters.iter().filter(|(_, w)| w.term <= old_term).map(|(index, _)| *index).collect();
        for index in stale {
            if let Some(waiter) = self.waiters.remove(&index) {
                (waiter.reject)(CommitWaitError::LeadershipLost { old_term, new_term });
            }
        }
    }

    /// Reject every outstanding waiter with `reason`, and clear the table.
    pub fn cancel_all(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        let indexes: Vec<u64> = self.waiters.keys().copied().collect();
        for index in indexes {
            if let Some(waiter) = self.waiters.remove(&index) {
                (waiter.reject)(CommitWaitError::Aborted(reason.clone()));
            }
        }
    }

    /// Reject any waiters whose deadline has passed. Should be invoked periodically by the
    /// driving event loop (e.g. alongside heartbeat ticks).
    pub fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> =
            self.waiters.iter().filter(|(_, w)| w.deadline <= now).map(|(index, _)| *index).collect();
        for index in expired {
            if let Some(waiter) = self.waiters.remove(&index) {
                (waiter.reject)(CommitWaitError::Timeout);
            }
        }
    }

    /// The number of waiters currently outstanding.
    pub fn get_pending_count(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn notify_in_order_when_registered_in_order() {
        let mut table: CommitWaiter<u64> = CommitWaiter::new();
        let observed = Arc::new(Mutex::new(Vec::new()));

        for index in [1, 2, 3] {
            let observed = observed.clone();
            table.register(
                index,
                1,
                Duration::from_secs(10),
                move |v| observed.lock().unwrap().push(v),
                |_| panic!("should not reject"),
            );
        }

        for index in [1, 2, 3] {
            table.notify_applied::<std::convert::Infallible>(index, |i| Ok(i));
        }

        assert_eq!(*observed.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(table.get_pending_count(), 0);
    }

    #[test]
    fn leadership_loss_rejects_older_term_waiters() {
        let mut table: CommitWaiter<u64> = CommitWaiter::new();
        let rejected = Arc::new(Mutex::new(None));
        let rejected2 = rejected.clone();

        table.register(
            5,
            1,
            Duration::from_secs(10),
            |_| panic!("should not fulfil"),
            move |err| *rejected2.lock().unwrap() = Some(err),
        );

        table.cancel_on_leadership_loss(1, 2);

        assert_eq!(table.get_pending_count(), 0);
        assert_eq!(
            *rejected.lock().unwrap(),
            Some(CommitWaitError::LeadershipLost { old_term: 1, new_term: 2 })
        );
    }

    #[test]
    fn sweep_timeouts_rejects_expired_waiters_only() {
        let mut table: CommitWaiter<u64> = CommitWaiter::new();
        let fired = Arc::new(Mutex::new(false));
        let fired2 = fired.clone();

        table.register(
            1,
            1,
            Duration::from_millis(0),
            |_| panic!("should not fulfil"),
            move |_| *fired2.lock().unwrap() = true,
        );
        table.register(2, 1, Duration::from_secs(60), |_| panic!("should not fulfil"), |_| {
            panic!("should not reject, not expired")
        });

        std::thread::sleep(Duration::from_millis(5));
        table.sweep_timeouts();

        assert!(*fired.lock().unwrap());
        assert_eq!(table.get_pending_count(), 1);
    }
}
