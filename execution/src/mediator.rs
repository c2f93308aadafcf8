//! Jittered scheduling of transition attempts.
//!
//! When many actors see the same phase expire at once, each waits a random
//! delay before attempting the transition and drops its attempt if a pushed
//! update shows the round already moved on. This only saves wasted
//! transactions; the store's conditional commit is what keeps transitions
//! single.

use crate::store::{Document, Store, StoreError};
use parlor_types::{GameKind, Key, Phase, Value};
use rand::{Rng, RngCore};
use std::time::Duration;
use tokio::time;

pub const DEFAULT_MAX_JITTER: Duration = Duration::from_secs(2);

/// The round position an attempt intends to advance from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhaseMark {
    pub round_id: u64,
    pub status: Phase,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mediation {
    Proceed,
    /// Another actor already advanced the round.
    Cancelled,
}

/// Uniform delay in `[0, max]`.
pub(crate) fn jitter(rng: &mut impl RngCore, max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rng.gen_range(0..=max_ms))
}

fn has_moved(document: &Option<Document>, mark: PhaseMark) -> bool {
    match document {
        Some(Document {
            value: Value::Round(record),
            ..
        }) => record.round_id != mark.round_id || record.status != mark.status,
        _ => false,
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Mediator {
    max_jitter: Duration,
}

impl Default for Mediator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_JITTER)
    }
}

impl Mediator {
    pub fn new(max_jitter: Duration) -> Self {
        Self { max_jitter }
    }

    /// Wait out a random delay, watching the round for a competing transition.
    pub async fn mediate<S: Store + ?Sized>(
        &self,
        store: &S,
        game: GameKind,
        mark: PhaseMark,
    ) -> Result<Mediation, StoreError> {
        if self.max_jitter.is_zero() {
            return Ok(Mediation::Proceed);
        }
        let mut updates = store.subscribe(&Key::Round(game))?;
        if has_moved(&updates.borrow_and_update(), mark) {
            return Ok(Mediation::Cancelled);
        }

        let delay = jitter(&mut rand::thread_rng(), self.max_jitter);
        let sleep = time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Ok(Mediation::Proceed),
                changed = updates.changed() => {
                    if changed.is_err() {
                        // The store dropped the channel; fall back to the plain delay.
                        (&mut sleep).await;
                        return Ok(Mediation::Proceed);
                    }
                    if has_moved(&updates.borrow_and_update(), mark) {
                        return Ok(Mediation::Cancelled);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Memory, Mutation, ReadSet};
    use parlor_types::RoundRecord;
    use rand::{rngs::StdRng, SeedableRng};
    use std::sync::Arc;

    #[test]
    fn jitter_stays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(3);
        let max = Duration::from_millis(250);
        for _ in 0..1_000 {
            assert!(jitter(&mut rng, max) <= max);
        }
        assert_eq!(jitter(&mut rng, Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test]
    async fn zero_jitter_proceeds_immediately() {
        let store = Memory::new();
        let mediator = Mediator::new(Duration::ZERO);
        let mark = PhaseMark {
            round_id: 1,
            status: Phase::Betting,
        };
        assert_eq!(
            mediator.mediate(&store, GameKind::Dice, mark).await.unwrap(),
            Mediation::Proceed
        );
    }

    #[tokio::test]
    async fn already_advanced_round_cancels() {
        let store = Memory::new();
        let mut record = RoundRecord::fresh(GameKind::Dice, 1, 0, 1_000);
        record.status = Phase::Resolving;
        store
            .commit(
                &ReadSet::new(),
                &[Mutation::Put(Key::Round(GameKind::Dice), Value::Round(record))],
            )
            .unwrap();

        let mediator = Mediator::new(Duration::from_secs(60));
        let mark = PhaseMark {
            round_id: 1,
            status: Phase::Betting,
        };
        assert_eq!(
            mediator.mediate(&store, GameKind::Dice, mark).await.unwrap(),
            Mediation::Cancelled
        );
    }

    #[tokio::test]
    async fn pushed_transition_cancels_pending_attempt() {
        let store = Arc::new(Memory::new());
        let record = RoundRecord::fresh(GameKind::Race, 4, 0, 1_000);
        store
            .commit(
                &ReadSet::new(),
                &[Mutation::Put(Key::Round(GameKind::Race), Value::Round(record.clone()))],
            )
            .unwrap();

        let mediator = Mediator::new(Duration::from_secs(3_600));
        let mark = PhaseMark {
            round_id: 4,
            status: Phase::Betting,
        };
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { mediator.mediate(&*store, GameKind::Race, mark).await })
        };
        tokio::task::yield_now().await;

        let mut advanced = record;
        advanced.status = Phase::Resolving;
        store
            .commit(
                &ReadSet::new(),
                &[Mutation::Put(Key::Round(GameKind::Race), Value::Round(advanced))],
            )
            .unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), Mediation::Cancelled);
    }
}
