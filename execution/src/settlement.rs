//! Payout computation and ledger application.
//!
//! [settle] is a pure function of the bet ledger, the outcome and the incoming
//! carry-over: replaying a committed round through it yields the same figures.
//! [apply] stages the resulting balance credits, treasury credit and profit log
//! entry on the transaction that publishes the outcome, so either all of them
//! land with the phase change or none do.

use crate::store::{Store, Txn};
use parlor_types::{
    game::BPS_DENOMINATOR, Bet, BetKey, ChoiceError, GameKind, Outcome, PayoutModel,
    ProfitLogEntry, RoundRecord, Winner, ZeroWinnerPolicy,
};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettlementError {
    #[error("settlement arithmetic overflowed")]
    Overflow,
    #[error("{outcome} outcome cannot settle a {game} round")]
    WrongGame { game: GameKind, outcome: GameKind },
    #[error("fixed-multiplier game {0} cannot carry a pool over")]
    UnexpectedCarry(GameKind),
    #[error(transparent)]
    Choice(#[from] ChoiceError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payout {
    pub key: BetKey,
    pub nickname: String,
    pub amount: u64,
}

/// Every figure a settled round moves.
///
/// For any round: `total_paid + house_credit + carry_out == total_wagered + carry_in`
/// whenever the house credit is non-negative (always for pooled games).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settlement {
    pub game: GameKind,
    pub round_id: u64,
    pub fee_bps: u16,
    pub bet_count: usize,
    pub total_wagered: u64,
    pub total_paid: u64,
    pub payouts: Vec<Payout>,
    /// Pooled games only: `floor(total_wagered * fee_bps / 10_000)`.
    pub house_fee: u64,
    /// Amount credited to the treasury.
    pub house_credit: u64,
    pub carry_in: u64,
    pub carry_out: u64,
    /// Signed house result, as recorded in the profit log.
    pub house_net: i64,
}

/// Compute the payouts for `bets` under `outcome`.
pub fn settle(
    game: GameKind,
    round_id: u64,
    bets: &BTreeMap<BetKey, Bet>,
    outcome: &Outcome,
    carry_in: u64,
) -> Result<Settlement, SettlementError> {
    if outcome.game() != game {
        return Err(SettlementError::WrongGame {
            game,
            outcome: outcome.game(),
        });
    }
    outcome.validate()?;

    let total_wagered = bets
        .values()
        .try_fold(0u64, |total, bet| total.checked_add(bet.amount))
        .ok_or(SettlementError::Overflow)?;

    let mut winners = Vec::new();
    for (key, bet) in bets {
        if bet.choice.wins(outcome)? {
            winners.push((key, bet));
        }
    }

    let model = game.payout_model();
    let (payouts, house_fee, carry_out) = match model {
        PayoutModel::FixedMultiplier => {
            if carry_in != 0 {
                return Err(SettlementError::UnexpectedCarry(game));
            }
            let mut payouts = Vec::with_capacity(winners.len());
            for (key, bet) in winners {
                let multiplier = bet
                    .choice
                    .fixed_multiplier()
                    .ok_or(SettlementError::WrongGame {
                        game,
                        outcome: outcome.game(),
                    })?;
                let amount = multiplier.apply(bet.amount).ok_or(SettlementError::Overflow)?;
                payouts.push(Payout {
                    key: key.clone(),
                    nickname: bet.nickname.clone(),
                    amount,
                });
            }
            (payouts, 0, 0)
        }
        PayoutModel::PariMutuel {
            fee_bps,
            zero_winners,
        } => {
            let house_fee = u64::try_from(
                total_wagered as u128 * fee_bps as u128 / BPS_DENOMINATOR as u128,
            )
            .map_err(|_| SettlementError::Overflow)?;
            let prize_pool = (total_wagered - house_fee)
                .checked_add(carry_in)
                .ok_or(SettlementError::Overflow)?;

            if winners.is_empty() {
                let carry_out = match zero_winners {
                    ZeroWinnerPolicy::HouseRetains => 0,
                    ZeroWinnerPolicy::CarryOver => prize_pool,
                };
                (Vec::new(), house_fee, carry_out)
            } else {
                let share = prize_pool / winners.len() as u64;
                let payouts = winners
                    .into_iter()
                    .filter(|_| share > 0)
                    .map(|(key, bet)| Payout {
                        key: key.clone(),
                        nickname: bet.nickname.clone(),
                        amount: share,
                    })
                    .collect();
                (payouts, house_fee, 0)
            }
        }
    };

    let total_paid = payouts
        .iter()
        .try_fold(0u64, |total: u64, payout: &Payout| total.checked_add(payout.amount))
        .ok_or(SettlementError::Overflow)?;

    // Whatever is neither paid out nor carried belongs to the house.
    let inflow = total_wagered as i128 + carry_in as i128;
    let net = inflow - total_paid as i128 - carry_out as i128;
    let house_net = i64::try_from(net).map_err(|_| SettlementError::Overflow)?;
    let house_credit = u64::try_from(net.max(0)).map_err(|_| SettlementError::Overflow)?;

    Ok(Settlement {
        game,
        round_id,
        fee_bps: model.fee_bps(),
        bet_count: bets.len(),
        total_wagered,
        total_paid,
        payouts,
        house_fee,
        house_credit,
        carry_in,
        carry_out,
        house_net,
    })
}

/// Stage `settlement` on `txn` and record its winners and carry-over on `record`.
pub fn apply<S: Store + ?Sized>(
    txn: &mut Txn<'_, S>,
    record: &mut RoundRecord,
    settlement: &Settlement,
    now_ms: u64,
) -> Result<(), SettlementError> {
    for payout in &settlement.payouts {
        let delta = i64::try_from(payout.amount).map_err(|_| SettlementError::Overflow)?;
        txn.adjust_balance(payout.key.participant.clone(), delta);
    }
    txn.credit_treasury(settlement.house_credit);
    if settlement.bet_count > 0 {
        txn.append_profit(ProfitLogEntry {
            game: settlement.game,
            round_id: settlement.round_id,
            amount: settlement.house_net,
            fee_bps: settlement.fee_bps,
            total_wagered: settlement.total_wagered,
            total_paid: settlement.total_paid,
            timestamp_ms: now_ms,
        });
    }

    record.last_round_winners = settlement
        .payouts
        .iter()
        .map(|payout| Winner {
            participant: payout.key.participant.clone(),
            nickname: payout.nickname.clone(),
            amount: payout.amount,
        })
        .collect();
    record.carry_over = settlement.carry_out;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_types::{Choice, Color, DiceCall};
    use proptest::prelude::*;

    fn bet(amount: u64, choice: Choice) -> Bet {
        Bet {
            amount,
            choice,
            nickname: "n".to_string(),
            submitted_at_ms: 0,
        }
    }

    fn ladder_outcome(winning_lane: u8) -> Outcome {
        // Identity paths: lane n lands on slot n.
        Outcome::Ladder {
            paths: [0, 1, 2, 3],
            prize_slot: winning_lane,
        }
    }

    #[test]
    fn fixed_multiplier_pays_winning_side() {
        let mut bets = BTreeMap::new();
        bets.insert(
            BetKey::new("alice", 0),
            bet(100, Choice::ColorWheel { color: Color::Red }),
        );
        bets.insert(
            BetKey::new("bob", 0),
            bet(40, Choice::ColorWheel { color: Color::Black }),
        );

        // Segment 3 is red.
        let settlement = settle(GameKind::ColorWheel, 1, &bets, &Outcome::ColorWheel { segment: 3 }, 0).unwrap();
        assert_eq!(settlement.payouts.len(), 1);
        assert_eq!(settlement.payouts[0].key.participant, "alice");
        assert_eq!(settlement.payouts[0].amount, 200);
        assert_eq!(settlement.fee_bps, 0);
        assert_eq!(settlement.house_net, -60);
        assert_eq!(settlement.house_credit, 0);
    }

    #[test]
    fn fixed_multiplier_rounds_down() {
        let mut bets = BTreeMap::new();
        bets.insert(
            BetKey::new("carol", 0),
            bet(15, Choice::Dice { call: DiceCall::Odd }),
        );
        let settlement = settle(GameKind::Dice, 4, &bets, &Outcome::Dice { face: 5 }, 0).unwrap();
        // 15 * 1.9 = 28.5
        assert_eq!(settlement.total_paid, 28);
    }

    #[test]
    fn crash_pays_cash_outs_below_crash_point() {
        let mut bets = BTreeMap::new();
        bets.insert(
            BetKey::new("dora", 0),
            bet(100, Choice::Crash { cash_out_x100: 150 }),
        );
        bets.insert(
            BetKey::new("ed", 0),
            bet(100, Choice::Crash { cash_out_x100: 300 }),
        );
        let settlement = settle(
            GameKind::Crash,
            2,
            &bets,
            &Outcome::Crash {
                crash_point_x100: 250,
            },
            0,
        )
        .unwrap();
        assert_eq!(settlement.total_paid, 150);
        assert_eq!(settlement.house_credit, 50);
        assert_eq!(settlement.house_net, 50);
    }

    #[test]
    fn pooled_single_winner_takes_pool_minus_fee() {
        let mut bets = BTreeMap::new();
        for (idx, participant) in ["a", "b", "c", "d"].iter().enumerate() {
            bets.insert(
                BetKey::new(*participant, 0),
                bet(500, Choice::Ladder { lane: idx as u8 }),
            );
        }
        let settlement = settle(GameKind::Ladder, 9, &bets, &ladder_outcome(2), 0).unwrap();
        assert_eq!(settlement.house_fee, 300);
        assert_eq!(settlement.payouts.len(), 1);
        assert_eq!(settlement.payouts[0].key.participant, "c");
        assert_eq!(settlement.payouts[0].amount, 1_700);
        assert_eq!(settlement.house_credit, 300);
        assert_eq!(settlement.fee_bps, 1_500);
    }

    #[test]
    fn pooled_remainder_goes_to_house() {
        let mut bets = BTreeMap::new();
        bets.insert(BetKey::new("a", 0), bet(100, Choice::Race { runner: 1 }));
        bets.insert(BetKey::new("b", 0), bet(100, Choice::Race { runner: 1 }));
        bets.insert(BetKey::new("c", 0), bet(101, Choice::Race { runner: 4 }));
        let settlement = settle(GameKind::Race, 3, &bets, &Outcome::Race { winner: 1 }, 0).unwrap();
        // pool 301, fee 30, prize 271 split two ways: 135 each, 1 left over.
        assert_eq!(settlement.house_fee, 30);
        assert!(settlement.payouts.iter().all(|payout| payout.amount == 135));
        assert_eq!(settlement.house_credit, 31);
    }

    #[test]
    fn zero_winners_house_retains() {
        let mut bets = BTreeMap::new();
        bets.insert(BetKey::new("a", 0), bet(500, Choice::Ladder { lane: 0 }));
        bets.insert(BetKey::new("a", 1), bet(500, Choice::Ladder { lane: 1 }));
        let settlement = settle(GameKind::Ladder, 5, &bets, &ladder_outcome(3), 0).unwrap();
        assert!(settlement.payouts.is_empty());
        assert_eq!(settlement.house_credit, 1_000);
        assert_eq!(settlement.carry_out, 0);
    }

    #[test]
    fn zero_winners_carry_over() {
        let mut bets = BTreeMap::new();
        bets.insert(BetKey::new("a", 0), bet(1_000, Choice::Race { runner: 0 }));
        let settlement = settle(GameKind::Race, 5, &bets, &Outcome::Race { winner: 5 }, 50).unwrap();
        assert!(settlement.payouts.is_empty());
        assert_eq!(settlement.house_fee, 100);
        assert_eq!(settlement.house_credit, 100);
        assert_eq!(settlement.carry_out, 950);
    }

    #[test]
    fn carried_pool_joins_next_prize() {
        let mut bets = BTreeMap::new();
        bets.insert(BetKey::new("a", 0), bet(100, Choice::Race { runner: 2 }));
        let settlement = settle(GameKind::Race, 6, &bets, &Outcome::Race { winner: 2 }, 950).unwrap();
        assert_eq!(settlement.total_paid, 90 + 950);
        assert_eq!(settlement.carry_out, 0);
    }

    #[test]
    fn replaying_an_outcome_is_deterministic() {
        let mut bets = BTreeMap::new();
        bets.insert(BetKey::new("a", 0), bet(320, Choice::Ladder { lane: 1 }));
        bets.insert(BetKey::new("b", 2), bet(180, Choice::Ladder { lane: 1 }));
        bets.insert(BetKey::new("c", 0), bet(75, Choice::Ladder { lane: 0 }));
        let outcome = ladder_outcome(1);
        let first = settle(GameKind::Ladder, 8, &bets, &outcome, 0).unwrap();
        let second = settle(GameKind::Ladder, 8, &bets, &outcome, 0).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn mismatched_outcome_is_rejected() {
        let bets = BTreeMap::new();
        assert!(matches!(
            settle(GameKind::Dice, 1, &bets, &Outcome::Race { winner: 0 }, 0),
            Err(SettlementError::WrongGame { .. })
        ));
        assert!(matches!(
            settle(GameKind::Dice, 1, &bets, &Outcome::Dice { face: 0 }, 0),
            Err(SettlementError::Choice(_))
        ));
    }

    fn pooled_game() -> impl Strategy<Value = GameKind> {
        prop_oneof![Just(GameKind::Ladder), Just(GameKind::Race)]
    }

    proptest! {
        #[test]
        fn pooled_settlement_conserves_funds(
            game in pooled_game(),
            wagers in proptest::collection::vec((1u64..1_000_000, 0u8..4), 0..40),
            winner in 0u8..4,
            carry_in in 0u64..1_000_000,
        ) {
            let mut bets = BTreeMap::new();
            for (idx, (amount, pick)) in wagers.into_iter().enumerate() {
                let choice = match game {
                    GameKind::Ladder => Choice::Ladder { lane: pick },
                    _ => Choice::Race { runner: pick },
                };
                bets.insert(BetKey::new(format!("p{idx}"), 0), bet(amount, choice));
            }
            let outcome = match game {
                GameKind::Ladder => ladder_outcome(winner),
                _ => Outcome::Race { winner },
            };
            let settlement = settle(game, 1, &bets, &outcome, carry_in).unwrap();
            prop_assert_eq!(
                settlement.total_paid as u128
                    + settlement.house_credit as u128
                    + settlement.carry_out as u128,
                settlement.total_wagered as u128 + carry_in as u128
            );
            prop_assert!(settlement.house_credit >= settlement.house_fee);
        }
    }
}
