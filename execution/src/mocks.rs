//! Test doubles: a hand-driven clock and a store wrapper that injects faults.

use crate::clock::Clock;
use crate::store::{Balances, Document, Mutation, ReadSet, Store, StoreError, Version};
use parlor_types::Key;
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc, Mutex,
};
use tokio::sync::watch;

/// A clock that only moves when told to. Clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now_ms: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(now_ms)),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

type Hook = Box<dyn FnOnce() + Send>;

/// Wraps a store and fails or interleaves operations on demand.
pub struct Faulty<S> {
    inner: Arc<S>,
    after_debit: Mutex<Option<Hook>>,
    after_version: Mutex<Option<(usize, Hook)>>,
    failing_commits: AtomicUsize,
    failing_credits: AtomicUsize,
}

impl<S> Faulty<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            after_debit: Mutex::new(None),
            after_version: Mutex::new(None),
            failing_commits: AtomicUsize::new(0),
            failing_credits: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    /// Run `hook` right after the next successful debit.
    pub fn after_next_debit(&self, hook: impl FnOnce() + Send + 'static) {
        if let Ok(mut slot) = self.after_debit.lock() {
            *slot = Some(Box::new(hook));
        }
    }

    /// Run `hook` right after the `count`-th version lookup from now.
    pub fn after_version_reads(&self, count: usize, hook: impl FnOnce() + Send + 'static) {
        if let Ok(mut slot) = self.after_version.lock() {
            *slot = Some((count, Box::new(hook)));
        }
    }

    /// Fail the next `count` commits as unavailable.
    pub fn fail_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` balance credits as unavailable.
    pub fn fail_credits(&self, count: usize) {
        self.failing_credits.store(count, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl<S: Store> Store for Faulty<S> {
    fn read(&self, key: &Key) -> Result<Option<Document>, StoreError> {
        self.inner.read(key)
    }

    fn version(&self, key: &Key) -> Result<Option<Version>, StoreError> {
        let version = self.inner.version(key)?;
        let hook = self.after_version.lock().ok().and_then(|mut slot| {
            if let Some((left, _)) = slot.as_mut() {
                if *left > 1 {
                    *left -= 1;
                    return None;
                }
            }
            slot.take().map(|(_, hook)| hook)
        });
        if let Some(hook) = hook {
            hook();
        }
        Ok(version)
    }

    fn subscribe(&self, key: &Key) -> Result<watch::Receiver<Option<Document>>, StoreError> {
        self.inner.subscribe(key)
    }

    fn commit(&self, reads: &ReadSet, mutations: &[Mutation]) -> Result<Version, StoreError> {
        if Self::take_failure(&self.failing_commits) {
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }
        self.inner.commit(reads, mutations)
    }
}

impl<S: Balances> Balances for Faulty<S> {
    fn atomic_adjust(&self, participant: &str, delta: i64) -> Result<u64, StoreError> {
        if delta > 0 && Self::take_failure(&self.failing_credits) {
            return Err(StoreError::Unavailable("injected credit failure".to_string()));
        }
        let balance = self.inner.atomic_adjust(participant, delta)?;
        if delta < 0 {
            let hook = self.after_debit.lock().ok().and_then(|mut slot| slot.take());
            if let Some(hook) = hook {
                hook();
            }
        }
        Ok(balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{open_account, Memory};

    #[test]
    fn manual_clock_is_shared_between_clones() {
        let clock = ManualClock::new(5);
        let other = clock.clone();
        clock.advance(10);
        assert_eq!(other.now_ms(), 15);
        other.set(1);
        assert_eq!(clock.now_ms(), 1);
    }

    #[test]
    fn injected_failures_are_consumed() {
        let memory = Arc::new(Memory::new());
        open_account(&*memory, "alice", 10).unwrap();
        let store = Faulty::new(memory);

        store.fail_credits(1);
        assert!(matches!(
            store.atomic_adjust("alice", 5),
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(store.atomic_adjust("alice", 5).unwrap(), 15);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        store.after_version_reads(2, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let key = Key::Balance("alice".to_string());
        store.version(&key).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(store.version(&key).unwrap(), store.inner().version(&key).unwrap());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        store.version(&key).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        store.fail_commits(2);
        assert!(store.commit(&ReadSet::new(), &[]).is_err());
        assert!(store.commit(&ReadSet::new(), &[]).is_err());
        assert!(store.commit(&ReadSet::new(), &[]).is_ok());
    }
}
