//! Wager registration.
//!
//! A bet debits the participant first through the balance service's atomic
//! adjustment (which refuses overdrafts), then records the wager in a
//! transaction that re-checks the round is still taking bets. If the second
//! step cannot commit, the debit is returned by a compensating credit.

use crate::{
    clock::Clock,
    store::{read_balance, read_round, transaction, Balances, Store, StoreError, TxnError},
};
use parlor_types::{
    round::{MAX_NICKNAME_LENGTH, MAX_PARTICIPANT_ID_LENGTH, MAX_ROUND_BETS},
    Bet, BetKey, Choice, ChoiceError, GameKind, Key, Value,
};
use serde::Deserialize;
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;
use tracing::{error, info, warn};

pub const DEFAULT_REFUND_ATTEMPTS: usize = 5;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct BetRequest {
    pub game: GameKind,
    pub participant: String,
    pub nickname: String,
    #[serde(default)]
    pub slot: u8,
    pub amount: u64,
    pub choice: Choice,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BetLimits {
    pub min_bet: u64,
    pub max_bet: u64,
    pub max_bets_per_round: usize,
}

impl Default for BetLimits {
    fn default() -> Self {
        Self {
            min_bet: 1,
            max_bet: 1_000_000,
            max_bets_per_round: MAX_ROUND_BETS,
        }
    }
}

impl BetLimits {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.min_bet == 0 {
            return Err("min_bet must be greater than zero");
        }
        if self.min_bet > self.max_bet {
            return Err("min_bet must not exceed max_bet");
        }
        if self.max_bet > i64::MAX as u64 {
            return Err("max_bet is too large");
        }
        if self.max_bets_per_round == 0 || self.max_bets_per_round > MAX_ROUND_BETS {
            return Err("max_bets_per_round out of range");
        }
        Ok(())
    }
}

/// Why a recorded debit could not be turned into a bet.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("round is missing")]
    RoundMissing,
    #[error("round changed before the bet landed")]
    RoundChanged,
    #[error("betting closed")]
    BettingClosed,
    #[error("a different choice is already on this slot")]
    ChoiceConflict,
    #[error("round is full")]
    TooManyBets,
    #[error("combined stake exceeds the limit")]
    OverLimit,
    #[error("gave up after conflicting writes")]
    Contention,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum BetError {
    #[error("amount must be positive")]
    ZeroAmount,
    #[error("amount out of range (got={amount}, min={min}, max={max})")]
    OutOfLimits { amount: u64, min: u64, max: u64 },
    #[error("invalid participant id")]
    InvalidParticipant,
    #[error("nickname too long")]
    InvalidNickname,
    #[error("a {choice} choice cannot be placed on {game}")]
    WrongGame { game: GameKind, choice: GameKind },
    #[error(transparent)]
    InvalidChoice(#[from] ChoiceError),
    #[error("slot out of range (got={slot}, slots={slots})")]
    InvalidSlot { slot: u8, slots: u8 },
    #[error("no round open for {0}")]
    RoundMissing(GameKind),
    #[error("betting is closed")]
    BettingClosed,
    #[error("a different choice is already on this slot")]
    ChoiceConflict,
    #[error("round is full")]
    TooManyBets,
    #[error("unknown account")]
    UnknownAccount,
    #[error("insufficient balance (available={available}, requested={requested})")]
    InsufficientBalance { available: u64, requested: u64 },
    #[error("bet rejected, funds returned ({0})")]
    Rejected(Rejection),
    #[error("bet rejected and refund of {amount} failed ({reason})")]
    RefundFailed { amount: u64, reason: Rejection },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A recorded wager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub round_id: u64,
    pub key: BetKey,
    /// Total stake on the key after this bet.
    pub stake: u64,
    /// Balance right after the debit.
    pub balance: u64,
}

pub struct Registrar<S: ?Sized, C> {
    store: Arc<S>,
    clock: C,
    limits: BTreeMap<GameKind, BetLimits>,
    max_attempts: usize,
    refund_attempts: usize,
}

impl<S, C> Registrar<S, C>
where
    S: Store + Balances + ?Sized,
    C: Clock,
{
    pub fn new(store: Arc<S>, clock: C) -> Self {
        Self {
            store,
            clock,
            limits: BTreeMap::new(),
            max_attempts: 3,
            refund_attempts: DEFAULT_REFUND_ATTEMPTS,
        }
    }

    pub fn with_limits(mut self, game: GameKind, limits: BetLimits) -> Self {
        self.limits.insert(game, limits);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_refund_attempts(mut self, refund_attempts: usize) -> Self {
        self.refund_attempts = refund_attempts.max(1);
        self
    }

    pub fn limits(&self, game: GameKind) -> BetLimits {
        self.limits.get(&game).copied().unwrap_or_default()
    }

    fn check_request(&self, request: &BetRequest, limits: &BetLimits) -> Result<(), BetError> {
        if request.amount == 0 {
            return Err(BetError::ZeroAmount);
        }
        if request.amount < limits.min_bet || request.amount > limits.max_bet {
            return Err(BetError::OutOfLimits {
                amount: request.amount,
                min: limits.min_bet,
                max: limits.max_bet,
            });
        }
        if request.participant.is_empty()
            || request.participant.len() > MAX_PARTICIPANT_ID_LENGTH
        {
            return Err(BetError::InvalidParticipant);
        }
        if request.nickname.len() > MAX_NICKNAME_LENGTH {
            return Err(BetError::InvalidNickname);
        }
        if request.choice.game() != request.game {
            return Err(BetError::WrongGame {
                game: request.game,
                choice: request.choice.game(),
            });
        }
        request.choice.validate()?;
        let slots = request.game.slots();
        if request.slot >= slots {
            return Err(BetError::InvalidSlot {
                slot: request.slot,
                slots,
            });
        }
        Ok(())
    }

    /// Debit the stake and record the wager on the open round.
    pub fn place_bet(&self, request: BetRequest) -> Result<Receipt, BetError> {
        let limits = self.limits(request.game);
        self.check_request(&request, &limits)?;
        let game = request.game;
        let key = BetKey::new(request.participant.clone(), request.slot);
        let amount = request.amount;

        // Reject what is already known to fail before touching the balance.
        let (_, observed) = read_round(&*self.store, game)?.ok_or(BetError::RoundMissing(game))?;
        if !observed.is_betting_open(self.clock.now_ms()) {
            return Err(BetError::BettingClosed);
        }
        if let Some(existing) = observed.bets.get(&key) {
            if existing.choice != request.choice {
                return Err(BetError::ChoiceConflict);
            }
            if existing.amount.saturating_add(amount) > limits.max_bet {
                return Err(BetError::OutOfLimits {
                    amount: existing.amount.saturating_add(amount),
                    min: limits.min_bet,
                    max: limits.max_bet,
                });
            }
        } else if observed.bets.len() >= limits.max_bets_per_round {
            return Err(BetError::TooManyBets);
        }
        let available = read_balance(&*self.store, &request.participant)?
            .ok_or(BetError::UnknownAccount)?;
        if available < amount {
            return Err(BetError::InsufficientBalance {
                available,
                requested: amount,
            });
        }

        let delta = i64::try_from(amount).map_err(|_| BetError::OutOfLimits {
            amount,
            min: limits.min_bet,
            max: limits.max_bet,
        })?;
        let balance = match self.store.atomic_adjust(&request.participant, -delta) {
            Ok(balance) => balance,
            Err(StoreError::InsufficientBalance {
                available,
                requested,
                ..
            }) => {
                return Err(BetError::InsufficientBalance {
                    available,
                    requested,
                })
            }
            Err(StoreError::Missing(_)) => return Err(BetError::UnknownAccount),
            Err(err) => return Err(err.into()),
        };

        let clock = &self.clock;
        let result = transaction(&*self.store, self.max_attempts, |txn| {
            let mut record = txn.round(game)?.ok_or(Rejection::RoundMissing)?;
            if record.round_id != observed.round_id {
                return Err(Rejection::RoundChanged);
            }
            if !record.is_betting_open(clock.now_ms()) {
                return Err(Rejection::BettingClosed);
            }
            let slots_used = record.bets.len();
            let stake = match record.bets.get_mut(&key) {
                Some(existing) if existing.choice != request.choice => {
                    return Err(Rejection::ChoiceConflict);
                }
                Some(existing) => {
                    let stake = existing
                        .amount
                        .checked_add(amount)
                        .filter(|stake| *stake <= limits.max_bet)
                        .ok_or(Rejection::OverLimit)?;
                    existing.amount = stake;
                    existing.nickname = request.nickname.clone();
                    stake
                }
                None => {
                    if slots_used >= limits.max_bets_per_round {
                        return Err(Rejection::TooManyBets);
                    }
                    record.bets.insert(
                        key.clone(),
                        Bet {
                            amount,
                            choice: request.choice,
                            nickname: request.nickname.clone(),
                            submitted_at_ms: clock.now_ms(),
                        },
                    );
                    amount
                }
            };
            let round_id = record.round_id;
            txn.put(Key::Round(game), Value::Round(record));
            Ok((round_id, stake))
        });

        let reason = match result {
            Ok((round_id, stake)) => {
                info!(%game, round_id, participant = %key.participant, slot = key.slot, amount, "bet placed");
                return Ok(Receipt {
                    round_id,
                    key,
                    stake,
                    balance,
                });
            }
            Err(TxnError::Aborted(reason)) => reason,
            Err(TxnError::Store(err)) => Rejection::Store(err),
            Err(TxnError::Exhausted(_)) => Rejection::Contention,
        };
        Err(self.refund(game, &key, amount, delta, reason))
    }

    /// Return a debit whose bet did not land.
    fn refund(&self, game: GameKind, key: &BetKey, amount: u64, delta: i64, reason: Rejection) -> BetError {
        for attempt in 1..=self.refund_attempts {
            match self.store.atomic_adjust(&key.participant, delta) {
                Ok(_) => {
                    warn!(%game, participant = %key.participant, amount, %reason, "bet rejected, funds returned");
                    return BetError::Rejected(reason);
                }
                Err(err) => {
                    warn!(%game, participant = %key.participant, amount, attempt, ?err, "refund attempt failed");
                }
            }
        }
        error!(%game, participant = %key.participant, amount, %reason, "refund failed");
        BetError::RefundFailed { amount, reason }
    }
}
