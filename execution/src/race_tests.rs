//! Racing controllers at a single phase boundary.
//!
//! Many independent actors observe the same expired phase at the same instant
//! and all attempt the transition. Exactly one commit may land, and the payout
//! it carries must be applied exactly once.

#[cfg(test)]
mod tests {
    use crate::controller::{RoundController, TickOutcome};
    use crate::mediator::Mediator;
    use crate::mocks::ManualClock;
    use crate::notify::TracingNotifier;
    use crate::store::{
        open_account, read_balance, read_profit_log, read_round, read_treasury, Memory, Mutation,
        ReadSet, Store,
    };
    use parlor_types::{Bet, BetKey, Choice, GameKind, Key, Outcome, Phase, RoundRecord, Value};
    use std::{sync::Arc, time::Duration};
    use tokio::sync::Barrier;

    fn seed_round(store: &Memory, record: RoundRecord) {
        store
            .commit(
                &ReadSet::new(),
                &[Mutation::Put(Key::Round(record.game), Value::Round(record))],
            )
            .unwrap();
    }

    async fn race(
        store: &Arc<Memory>,
        clock: &ManualClock,
        game: GameKind,
        actors: usize,
        jitter: Duration,
    ) -> Vec<TickOutcome> {
        let barrier = Arc::new(Barrier::new(actors));
        let mut handles = Vec::with_capacity(actors);
        for actor in 0..actors {
            let mut controller = RoundController::new(
                format!("actor-{actor}"),
                store.clone(),
                clock.clone(),
                TracingNotifier,
            )
            .with_mediator(Mediator::new(jitter));
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                controller.tick(game).await.unwrap()
            }));
        }
        let mut outcomes = Vec::with_capacity(actors);
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }
        outcomes
    }

    fn advanced(outcomes: &[TickOutcome]) -> usize {
        outcomes
            .iter()
            .filter(|outcome| matches!(outcome, TickOutcome::Advanced(_)))
            .count()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_exactly_one_commit_per_boundary() {
        for actors in [2, 5, 10, 25, 50, 100] {
            let store = Arc::new(Memory::new());
            let clock = ManualClock::new(15_000);
            seed_round(&store, RoundRecord::fresh(GameKind::Dice, 1, 0, 15_000));

            let outcomes = race(&store, &clock, GameKind::Dice, actors, Duration::ZERO).await;
            assert_eq!(advanced(&outcomes), 1, "actors={actors}");
            assert!(outcomes.iter().all(|outcome| matches!(
                outcome,
                TickOutcome::Advanced(_) | TickOutcome::Lost | TickOutcome::NotDue
            )));

            let (_, record) = read_round(&*store, GameKind::Dice).unwrap().unwrap();
            assert_eq!(record.status, Phase::Resolving);
            assert_eq!(record.round_id, 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_racing_settlement_pays_once() {
        let actors = 40;
        let store = Arc::new(Memory::new());
        let clock = ManualClock::new(30_000);

        let mut record = RoundRecord::fresh(GameKind::Race, 9, 0, 20_000);
        record.status = Phase::Resolving;
        record.phase_deadline_ms = 30_000;
        for runner in 0..6u8 {
            let participant = format!("p{runner}");
            open_account(&*store, &participant, 0).unwrap();
            record.bets.insert(
                BetKey::new(participant.clone(), 0),
                Bet {
                    amount: 100,
                    choice: Choice::Race { runner },
                    nickname: participant,
                    submitted_at_ms: 1,
                },
            );
        }
        seed_round(&store, record);

        let outcomes = race(&store, &clock, GameKind::Race, actors, Duration::from_millis(20)).await;
        assert_eq!(advanced(&outcomes), 1);

        // Pool 600, 10% fee, one winning runner takes the rest.
        let balances: u64 = (0..6)
            .map(|runner| read_balance(&*store, &format!("p{runner}")).unwrap().unwrap())
            .sum();
        assert_eq!(balances, 540);
        assert_eq!(read_treasury(&*store).unwrap().balance, 60);
        assert_eq!(read_profit_log(&*store, 0, 10).unwrap().len(), 1);

        let (_, record) = read_round(&*store, GameKind::Race).unwrap().unwrap();
        assert_eq!(record.status, Phase::Result);
        assert_eq!(record.last_round_winners.len(), 1);
        assert_eq!(record.last_round_winners[0].amount, 540);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_racing_zero_winner_pool_goes_to_treasury_once() {
        let actors = 25;
        let store = Arc::new(Memory::new());
        let clock = ManualClock::new(30_000);

        // Lane 0 reaches the prize slot and nobody picked it.
        let mut record = RoundRecord::fresh(GameKind::Ladder, 4, 0, 20_000);
        record.status = Phase::Resolving;
        record.phase_deadline_ms = 25_000;
        record.outcome = Some(Outcome::Ladder {
            paths: [0, 1, 2, 3],
            prize_slot: 0,
        });
        for lane in 1..4u8 {
            let participant = format!("p{lane}");
            open_account(&*store, &participant, 0).unwrap();
            record.bets.insert(
                BetKey::new(participant.clone(), 0),
                Bet {
                    amount: 400,
                    choice: Choice::Ladder { lane },
                    nickname: participant,
                    submitted_at_ms: 1,
                },
            );
        }
        seed_round(&store, record);

        let outcomes = race(&store, &clock, GameKind::Ladder, actors, Duration::from_millis(20)).await;
        assert_eq!(advanced(&outcomes), 1);

        assert_eq!(read_treasury(&*store).unwrap().balance, 1_200);
        let log = read_profit_log(&*store, 0, 10).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].amount, 1_200);
        assert_eq!(log[0].total_paid, 0);
        for lane in 1..4u8 {
            assert_eq!(read_balance(&*store, &format!("p{lane}")).unwrap(), Some(0));
        }

        let (_, record) = read_round(&*store, GameKind::Ladder).unwrap().unwrap();
        assert_eq!(record.status, Phase::Result);
        assert_eq!(record.carry_over, 0);
        assert!(record.last_round_winners.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_racing_initialization_creates_one_round() {
        let store = Arc::new(Memory::new());
        let clock = ManualClock::new(0);
        let outcomes = race(&store, &clock, GameKind::Ladder, 30, Duration::ZERO).await;

        let initialized: Vec<u64> = outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                TickOutcome::Initialized(round_id) => Some(*round_id),
                _ => None,
            })
            .collect();
        assert_eq!(initialized, vec![1]);
        assert!(store.read(&Key::RoundCounter(GameKind::Ladder)).unwrap().is_some());
    }
}
