//! Round controller: the per-actor loop that drives a game's round forward.
//!
//! Every connected actor runs one controller per game against the shared store.
//! On each tick the controller reads the round record and, once the current
//! phase is due, waits out the mediator's jitter and then attempts a guarded
//! transition. The transaction re-reads the record, checks that the round is
//! still where the controller saw it, computes the next phase (drawing the
//! outcome and settling the ledger when the phase calls for it) and writes it
//! back. Of any number of actors attempting the same boundary, exactly one
//! commit lands; the rest abort on the precondition and report [TickOutcome::Lost].

use crate::{
    clock::Clock,
    mediator::{Mediation, Mediator, PhaseMark},
    notify::{Notice, Notifier},
    outcome::{draw, reveal_phase},
    round_scheduler::{PhaseConfig, RoundScheduler, TransitionResult},
    settlement::{self, Settlement, SettlementError},
    store::{read_round, transaction, Store, StoreError, Txn, TxnError, Version},
};
use parlor_types::{GameKind, Key, Phase, RoundRecord, Value};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::watch,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info, trace, warn};

pub const DEFAULT_MAX_ATTEMPTS: usize = 3;
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("no schedule configured for {0}")]
    UnknownGame(GameKind),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("settlement failed: {0}")]
    Settlement(#[from] SettlementError),
}

/// Why a transition attempt was discarded.
#[derive(Debug, Error)]
enum Abort {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Settlement(#[from] SettlementError),
    #[error("round record is missing")]
    Missing,
    #[error("round record already exists")]
    Exists,
    #[error("round moved (expected={expected:?}, found={found:?})")]
    Moved { expected: PhaseMark, found: PhaseMark },
    #[error("phase is not due")]
    NotDue,
    #[error("round ids exhausted")]
    RoundIdsExhausted,
    #[error("unreadable round record was replaced")]
    Replaced,
}

/// A committed phase change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub game: GameKind,
    /// Round id of the record as written (a new id after a wrap).
    pub round_id: u64,
    pub from: Phase,
    pub to: Phase,
    /// Present when the transition entered Result.
    pub settlement: Option<Settlement>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    NotDue,
    /// This actor created the first record with the given round id.
    Initialized(u64),
    Advanced(Transition),
    /// Another actor committed first.
    Lost,
    /// The mediator saw the round advance before this actor attempted.
    Cancelled,
    /// The record does not decode; waiting before replacing it.
    Unreadable,
    /// This actor replaced an unreadable record with a fresh round.
    Reinitialized(u64),
}

fn mark(record: &RoundRecord) -> PhaseMark {
    PhaseMark {
        round_id: record.round_id,
        status: record.status,
    }
}

/// Next unused round id, recorded on the counter in the same transaction.
fn issue_round_id<S: Store + ?Sized>(
    txn: &mut Txn<'_, S>,
    game: GameKind,
    floor: u64,
) -> Result<u64, Abort> {
    let issued = txn.round_counter(game)?.max(floor);
    let next = issued.checked_add(1).ok_or(Abort::RoundIdsExhausted)?;
    txn.put(Key::RoundCounter(game), Value::RoundCounter(next));
    Ok(next)
}

fn open_round<S: Store + ?Sized>(
    txn: &mut Txn<'_, S>,
    scheduler: &RoundScheduler,
    now_ms: u64,
) -> Result<RoundRecord, Abort> {
    let game = scheduler.game();
    let round_id = issue_round_id(txn, game, 0)?;
    let record = RoundRecord::fresh(game, round_id, now_ms, scheduler.config().betting_ms);
    txn.put(Key::Round(game), Value::Round(record.clone()));
    Ok(record)
}

/// The transition body: everything is re-derived from what this attempt reads.
fn advance<S: Store + ?Sized>(
    txn: &mut Txn<'_, S>,
    scheduler: &RoundScheduler,
    expected: PhaseMark,
    now_ms: u64,
) -> Result<Transition, Abort> {
    let game = scheduler.game();
    let mut record = txn.round(game)?.ok_or(Abort::Missing)?;
    let found = mark(&record);
    if found != expected {
        return Err(Abort::Moved { expected, found });
    }
    let TransitionResult::TransitionTo {
        phase: to,
        phase_ends_at_ms,
    } = scheduler.check_transition(&record, now_ms)
    else {
        return Err(Abort::NotDue);
    };

    let from = record.status;
    let mut settled = None;
    match to {
        Phase::Betting => {
            let round_id = issue_round_id(txn, game, record.round_id)?;
            let mut fresh =
                RoundRecord::fresh(game, round_id, now_ms, scheduler.config().betting_ms);
            fresh.carry_over = record.carry_over;
            fresh.last_round_winners = std::mem::take(&mut record.last_round_winners);
            record = fresh;
        }
        Phase::Resolving => {
            if reveal_phase(game) == Phase::Resolving {
                record.outcome = Some(draw(game, &mut rand::thread_rng()));
            }
        }
        Phase::Result => {
            let outcome = match &record.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    let outcome = draw(game, &mut rand::thread_rng());
                    record.outcome = Some(outcome.clone());
                    outcome
                }
            };
            let settlement = settlement::settle(
                game,
                record.round_id,
                &record.bets,
                &outcome,
                record.carry_over,
            )?;
            settlement::apply(txn, &mut record, &settlement, now_ms)?;
            settled = Some(settlement);
        }
    }
    if to != Phase::Betting {
        record.status = to;
        record.phase_started_at_ms = now_ms;
        record.phase_deadline_ms = phase_ends_at_ms;
    }

    let round_id = record.round_id;
    txn.put(Key::Round(game), Value::Round(record));
    Ok(Transition {
        game,
        round_id,
        from,
        to,
        settlement: settled,
    })
}

pub struct RoundController<S: ?Sized, C, N> {
    actor: String,
    store: Arc<S>,
    clock: C,
    notifier: N,
    schedulers: BTreeMap<GameKind, RoundScheduler>,
    mediator: Mediator,
    max_attempts: usize,
    /// When each game's record was first seen unreadable, and the version of that row.
    unreadable_since: BTreeMap<GameKind, (u64, Version)>,
}

impl<S, C, N> RoundController<S, C, N>
where
    S: Store + ?Sized,
    C: Clock,
    N: Notifier,
{
    /// A controller for every game with default durations and jitter.
    pub fn new(actor: impl Into<String>, store: Arc<S>, clock: C, notifier: N) -> Self {
        let schedulers = GameKind::ALL
            .into_iter()
            .map(|game| (game, RoundScheduler::new(game, PhaseConfig::default_for(game))))
            .collect();
        Self {
            actor: actor.into(),
            store,
            clock,
            notifier,
            schedulers,
            mediator: Mediator::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            unreadable_since: BTreeMap::new(),
        }
    }

    pub fn with_schedule(mut self, game: GameKind, config: PhaseConfig) -> Self {
        self.schedulers
            .insert(game, RoundScheduler::new(game, config));
        self
    }

    pub fn with_mediator(mut self, mediator: Mediator) -> Self {
        self.mediator = mediator;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    fn scheduler(&self, game: GameKind) -> Result<&RoundScheduler, ControllerError> {
        self.schedulers
            .get(&game)
            .ok_or(ControllerError::UnknownGame(game))
    }

    /// Observe `game` once and attempt its next transition if one is due.
    pub async fn tick(&mut self, game: GameKind) -> Result<TickOutcome, ControllerError> {
        let now_ms = self.clock.now_ms();
        let observed = match read_round(&*self.store, game) {
            Ok(Some((_, record))) => {
                self.unreadable_since.remove(&game);
                record
            }
            Ok(None) => return self.initialize(game),
            Err(StoreError::Decode { .. }) | Err(StoreError::UnexpectedValue(_)) => {
                return self.recover(game, now_ms);
            }
            Err(err) => return Err(err.into()),
        };

        let scheduler = self.scheduler(game)?;
        if !scheduler.is_due(&observed, now_ms) {
            return Ok(TickOutcome::NotDue);
        }

        let expected = mark(&observed);
        match self.mediator.mediate(&*self.store, game, expected).await? {
            Mediation::Proceed => {}
            Mediation::Cancelled => {
                trace!(actor = %self.actor, %game, round_id = expected.round_id, "attempt cancelled");
                return Ok(TickOutcome::Cancelled);
            }
        }

        let scheduler = self.scheduler(game)?;
        let clock = &self.clock;
        let result = transaction(&*self.store, self.max_attempts, |txn| {
            advance(txn, scheduler, expected, clock.now_ms())
        });
        match result {
            Ok(transition) => {
                info!(
                    actor = %self.actor,
                    %game,
                    round_id = transition.round_id,
                    from = transition.from.as_str(),
                    to = transition.to.as_str(),
                    "round advanced"
                );
                if let Some(settlement) = &transition.settlement {
                    self.announce(settlement);
                }
                Ok(TickOutcome::Advanced(transition))
            }
            Err(TxnError::Aborted(Abort::Store(err))) | Err(TxnError::Store(err)) => {
                warn!(actor = %self.actor, %game, ?err, "transition failed");
                Err(err.into())
            }
            Err(TxnError::Aborted(Abort::Settlement(err))) => {
                error!(actor = %self.actor, %game, ?err, "settlement failed");
                Err(err.into())
            }
            Err(err) => {
                debug!(actor = %self.actor, %game, reason = %err, "transition lost");
                Ok(TickOutcome::Lost)
            }
        }
    }

    fn announce(&self, settlement: &Settlement) {
        for payout in &settlement.payouts {
            self.notifier.notify(Notice {
                participant: payout.key.participant.clone(),
                nickname: payout.nickname.clone(),
                game: settlement.game,
                round_id: settlement.round_id,
                amount: payout.amount,
            });
        }
    }

    fn initialize(&mut self, game: GameKind) -> Result<TickOutcome, ControllerError> {
        let scheduler = self.scheduler(game)?;
        let clock = &self.clock;
        let result = transaction(&*self.store, self.max_attempts, |txn| {
            if txn.round(game)?.is_some() {
                return Err(Abort::Exists);
            }
            open_round(txn, scheduler, clock.now_ms())
        });
        match result {
            Ok(record) => {
                info!(actor = %self.actor, %game, round_id = record.round_id, "round initialized");
                Ok(TickOutcome::Initialized(record.round_id))
            }
            Err(TxnError::Aborted(Abort::Store(err))) | Err(TxnError::Store(err)) => Err(err.into()),
            Err(err) => {
                debug!(actor = %self.actor, %game, reason = %err, "initialization lost");
                Ok(TickOutcome::Lost)
            }
        }
    }

    /// Replace a record that has stayed unreadable for a full cycle.
    fn recover(&mut self, game: GameKind, now_ms: u64) -> Result<TickOutcome, ControllerError> {
        let scheduler = self.scheduler(game)?;
        let grace = scheduler.config().cycle_duration_ms(scheduler.plan());
        let Some(version) = self.store.version(&Key::Round(game))? else {
            self.unreadable_since.remove(&game);
            return self.initialize(game);
        };
        // A different unreadable row restarts the grace period.
        let (since, corrupt) = match self.unreadable_since.get(&game) {
            Some(&(since, seen)) if seen == version => (since, seen),
            _ => {
                self.unreadable_since.insert(game, (now_ms, version));
                (now_ms, version)
            }
        };
        if now_ms.saturating_sub(since) < grace {
            warn!(actor = %self.actor, %game, since, "round record unreadable");
            return Ok(TickOutcome::Unreadable);
        }

        let scheduler = self.scheduler(game)?;
        let clock = &self.clock;
        let result = transaction(&*self.store, self.max_attempts, |txn| {
            // Only the row found unreadable may be replaced; pinning it makes a
            // concurrent recovery conflict.
            if txn.pin(&Key::Round(game))? != Some(corrupt) {
                return Err(Abort::Replaced);
            }
            open_round(txn, scheduler, clock.now_ms())
        });
        match result {
            Ok(record) => {
                self.unreadable_since.remove(&game);
                warn!(actor = %self.actor, %game, round_id = record.round_id, "round record reinitialized");
                Ok(TickOutcome::Reinitialized(record.round_id))
            }
            Err(TxnError::Aborted(Abort::Store(err))) | Err(TxnError::Store(err)) => Err(err.into()),
            Err(err) => {
                debug!(actor = %self.actor, %game, reason = %err, "reinitialization lost");
                Ok(TickOutcome::Lost)
            }
        }
    }

    /// Tick `game` every `period` until `shutdown` flips to true or closes.
    pub async fn run(mut self, game: GameKind, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            match self.tick(game).await {
                Ok(outcome) => trace!(actor = %self.actor, %game, ?outcome, "tick"),
                Err(err) => warn!(actor = %self.actor, %game, ?err, "tick failed"),
            }
        }
        debug!(actor = %self.actor, %game, "controller stopped");
    }
}
