//! The closed set of games, their wagers, outcomes and payout tables.
//!
//! Each game has a statically known phase plan and payout model. Fixed-multiplier
//! payouts are resolved by exhaustive `match` over the choice enums rather than a
//! runtime-keyed table.

use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error, FixedSize, Read, ReadExt, Write};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error as ThisError;

/// Segments on the color wheel (one green, seven red, seven black).
pub const WHEEL_SEGMENTS: u8 = 15;
pub const DIE_FACES: u8 = 6;
/// Lanes (and bottom slots) on the ladder board.
pub const LADDER_LANES: u8 = 4;
pub const RACE_RUNNERS: u8 = 6;
/// Lowest accepted crash cash-out target (1.01x), in hundredths.
pub const MIN_CASH_OUT_X100: u32 = 101;
/// Highest crash point that can be drawn (1000x), in hundredths.
pub const MAX_CRASH_X100: u32 = 100_000;
pub const BPS_DENOMINATOR: u64 = 10_000;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GameKind {
    ColorWheel = 0,
    Dice = 1,
    Crash = 2,
    Ladder = 3,
    Race = 4,
}

impl GameKind {
    pub const ALL: [GameKind; 5] = [
        GameKind::ColorWheel,
        GameKind::Dice,
        GameKind::Crash,
        GameKind::Ladder,
        GameKind::Race,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GameKind::ColorWheel => "color-wheel",
            GameKind::Dice => "dice",
            GameKind::Crash => "crash",
            GameKind::Ladder => "ladder",
            GameKind::Race => "race",
        }
    }

    /// How the game moves from Betting to Result.
    pub fn phase_plan(&self) -> PhasePlan {
        match self {
            GameKind::ColorWheel => PhasePlan::Merged,
            GameKind::Dice | GameKind::Ladder | GameKind::Race => PhasePlan::Timed,
            GameKind::Crash => PhasePlan::Continuous,
        }
    }

    pub fn payout_model(&self) -> PayoutModel {
        match self {
            GameKind::ColorWheel | GameKind::Dice | GameKind::Crash => PayoutModel::FixedMultiplier,
            GameKind::Ladder => PayoutModel::PariMutuel {
                fee_bps: 1_500,
                zero_winners: ZeroWinnerPolicy::HouseRetains,
            },
            GameKind::Race => PayoutModel::PariMutuel {
                fee_bps: 1_000,
                zero_winners: ZeroWinnerPolicy::CarryOver,
            },
        }
    }

    /// Number of simultaneous bets a single participant may hold in one round.
    pub fn slots(&self) -> u8 {
        match self {
            GameKind::Ladder => LADDER_LANES,
            _ => 1,
        }
    }
}

impl fmt::Display for GameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GameKind {
    type Err = ChoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GameKind::ALL
            .into_iter()
            .find(|game| game.as_str() == s)
            .ok_or_else(|| ChoiceError::UnknownGame(s.to_string()))
    }
}

impl TryFrom<u8> for GameKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(GameKind::ColorWheel),
            1 => Ok(GameKind::Dice),
            2 => Ok(GameKind::Crash),
            3 => Ok(GameKind::Ladder),
            4 => Ok(GameKind::Race),
            _ => Err(()),
        }
    }
}

impl Write for GameKind {
    fn write(&self, writer: &mut impl BufMut) {
        (*self as u8).write(writer);
    }
}

impl Read for GameKind {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let value = u8::read(reader)?;
        GameKind::try_from(value).map_err(|_| Error::InvalidEnum(value))
    }
}

impl EncodeSize for GameKind {
    fn encode_size(&self) -> usize {
        u8::SIZE
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhasePlan {
    /// Betting goes straight to Result; the outcome is instantaneous.
    Merged,
    /// Betting, Resolving and Result each last a fixed duration.
    Timed,
    /// Resolving ends when a live value crosses the drawn threshold (or a fail-safe fires).
    Continuous,
}

impl PhasePlan {
    pub fn has_resolving(&self) -> bool {
        !matches!(self, PhasePlan::Merged)
    }
}

/// What happens to a pooled prize when nobody picked the outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZeroWinnerPolicy {
    HouseRetains,
    CarryOver,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayoutModel {
    FixedMultiplier,
    PariMutuel {
        fee_bps: u16,
        zero_winners: ZeroWinnerPolicy,
    },
}

impl PayoutModel {
    pub fn fee_bps(&self) -> u16 {
        match self {
            PayoutModel::FixedMultiplier => 0,
            PayoutModel::PariMutuel { fee_bps, .. } => *fee_bps,
        }
    }
}

/// A payout ratio applied to the wagered amount, rounded down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Multiplier {
    pub num: u64,
    pub den: u64,
}

impl Multiplier {
    pub const fn new(num: u64, den: u64) -> Self {
        Self { num, den }
    }

    pub const fn whole(n: u64) -> Self {
        Self { num: n, den: 1 }
    }

    /// Gross payout (stake included) for `amount`, or `None` on overflow.
    pub fn apply(&self, amount: u64) -> Option<u64> {
        if self.den == 0 {
            return None;
        }
        let gross = (amount as u128).checked_mul(self.num as u128)? / self.den as u128;
        u64::try_from(gross).ok()
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    Red = 0,
    Black = 1,
    Green = 2,
}

impl Color {
    pub const fn multiplier(self) -> Multiplier {
        match self {
            Color::Red | Color::Black => Multiplier::whole(2),
            Color::Green => Multiplier::whole(14),
        }
    }

    /// Segment 0 is green, 1..=7 red, the rest black.
    pub fn of_segment(segment: u8) -> Color {
        match segment {
            0 => Color::Green,
            1..=7 => Color::Red,
            _ => Color::Black,
        }
    }
}

impl TryFrom<u8> for Color {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Color::Red),
            1 => Ok(Color::Black),
            2 => Ok(Color::Green),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "call", content = "face", rename_all = "snake_case")]
pub enum DiceCall {
    Odd,
    Even,
    Face(u8),
}

impl DiceCall {
    pub const fn multiplier(self) -> Multiplier {
        match self {
            DiceCall::Odd | DiceCall::Even => Multiplier::new(19, 10),
            DiceCall::Face(_) => Multiplier::new(57, 10),
        }
    }

    pub fn wins(self, face: u8) -> bool {
        match self {
            DiceCall::Odd => face % 2 == 1,
            DiceCall::Even => face % 2 == 0,
            DiceCall::Face(called) => called == face,
        }
    }
}

/// A wager's pick, tagged by the game it belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "game", rename_all = "kebab-case")]
pub enum Choice {
    ColorWheel { color: Color },
    Dice { call: DiceCall },
    /// Automatic cash-out target in hundredths (150 = 1.50x).
    Crash { cash_out_x100: u32 },
    Ladder { lane: u8 },
    Race { runner: u8 },
}

impl Choice {
    pub fn game(&self) -> GameKind {
        match self {
            Choice::ColorWheel { .. } => GameKind::ColorWheel,
            Choice::Dice { .. } => GameKind::Dice,
            Choice::Crash { .. } => GameKind::Crash,
            Choice::Ladder { .. } => GameKind::Ladder,
            Choice::Race { .. } => GameKind::Race,
        }
    }

    pub fn validate(&self) -> Result<(), ChoiceError> {
        match *self {
            Choice::ColorWheel { .. } => Ok(()),
            Choice::Dice { call: DiceCall::Face(face) } if face == 0 || face > DIE_FACES => {
                Err(ChoiceError::FaceOutOfRange(face))
            }
            Choice::Dice { .. } => Ok(()),
            Choice::Crash { cash_out_x100 }
                if !(MIN_CASH_OUT_X100..=MAX_CRASH_X100).contains(&cash_out_x100) =>
            {
                Err(ChoiceError::CashOutOutOfRange(cash_out_x100))
            }
            Choice::Crash { .. } => Ok(()),
            Choice::Ladder { lane } if lane >= LADDER_LANES => Err(ChoiceError::LaneOutOfRange(lane)),
            Choice::Ladder { .. } => Ok(()),
            Choice::Race { runner } if runner >= RACE_RUNNERS => {
                Err(ChoiceError::RunnerOutOfRange(runner))
            }
            Choice::Race { .. } => Ok(()),
        }
    }

    /// Payout ratio for fixed-multiplier games; `None` for pooled games.
    pub fn fixed_multiplier(&self) -> Option<Multiplier> {
        match *self {
            Choice::ColorWheel { color } => Some(color.multiplier()),
            Choice::Dice { call } => Some(call.multiplier()),
            Choice::Crash { cash_out_x100 } => Some(Multiplier::new(cash_out_x100 as u64, 100)),
            Choice::Ladder { .. } | Choice::Race { .. } => None,
        }
    }

    pub fn wins(&self, outcome: &Outcome) -> Result<bool, ChoiceError> {
        match (*self, outcome) {
            (Choice::ColorWheel { color }, Outcome::ColorWheel { segment }) => {
                Ok(Color::of_segment(*segment) == color)
            }
            (Choice::Dice { call }, Outcome::Dice { face }) => Ok(call.wins(*face)),
            (Choice::Crash { cash_out_x100 }, Outcome::Crash { crash_point_x100 }) => {
                Ok(cash_out_x100 <= *crash_point_x100)
            }
            (Choice::Ladder { lane }, outcome @ Outcome::Ladder { .. }) => {
                Ok(outcome.ladder_winning_lane() == Some(lane))
            }
            (Choice::Race { runner }, Outcome::Race { winner }) => Ok(runner == *winner),
            (choice, outcome) => Err(ChoiceError::GameMismatch {
                choice: choice.game(),
                outcome: outcome.game(),
            }),
        }
    }
}

impl Write for Choice {
    fn write(&self, writer: &mut impl BufMut) {
        self.game().write(writer);
        match *self {
            Choice::ColorWheel { color } => (color as u8).write(writer),
            Choice::Dice { call } => match call {
                DiceCall::Odd => 0u8.write(writer),
                DiceCall::Even => 1u8.write(writer),
                DiceCall::Face(face) => {
                    2u8.write(writer);
                    face.write(writer);
                }
            },
            Choice::Crash { cash_out_x100 } => cash_out_x100.write(writer),
            Choice::Ladder { lane } => lane.write(writer),
            Choice::Race { runner } => runner.write(writer),
        }
    }
}

impl Read for Choice {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let choice = match GameKind::read(reader)? {
            GameKind::ColorWheel => {
                let value = u8::read(reader)?;
                let color = Color::try_from(value).map_err(|_| Error::InvalidEnum(value))?;
                Choice::ColorWheel { color }
            }
            GameKind::Dice => {
                let call = match u8::read(reader)? {
                    0 => DiceCall::Odd,
                    1 => DiceCall::Even,
                    2 => DiceCall::Face(u8::read(reader)?),
                    i => return Err(Error::InvalidEnum(i)),
                };
                Choice::Dice { call }
            }
            GameKind::Crash => Choice::Crash {
                cash_out_x100: u32::read(reader)?,
            },
            GameKind::Ladder => Choice::Ladder {
                lane: u8::read(reader)?,
            },
            GameKind::Race => Choice::Race {
                runner: u8::read(reader)?,
            },
        };
        choice
            .validate()
            .map_err(|_| Error::Invalid("Choice", "out of range"))?;
        Ok(choice)
    }
}

impl EncodeSize for Choice {
    fn encode_size(&self) -> usize {
        u8::SIZE
            + match self {
                Choice::ColorWheel { .. } => u8::SIZE,
                Choice::Dice { call: DiceCall::Face(_) } => 2 * u8::SIZE,
                Choice::Dice { .. } => u8::SIZE,
                Choice::Crash { .. } => u32::SIZE,
                Choice::Ladder { .. } => u8::SIZE,
                Choice::Race { .. } => u8::SIZE,
            }
    }
}

/// The drawn result of a round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    ColorWheel {
        segment: u8,
    },
    Dice {
        face: u8,
    },
    Crash {
        crash_point_x100: u32,
    },
    Ladder {
        /// `paths[lane]` is the bottom slot that lane leads to.
        paths: [u8; LADDER_LANES as usize],
        prize_slot: u8,
    },
    Race {
        winner: u8,
    },
}

impl Outcome {
    pub fn game(&self) -> GameKind {
        match self {
            Outcome::ColorWheel { .. } => GameKind::ColorWheel,
            Outcome::Dice { .. } => GameKind::Dice,
            Outcome::Crash { .. } => GameKind::Crash,
            Outcome::Ladder { .. } => GameKind::Ladder,
            Outcome::Race { .. } => GameKind::Race,
        }
    }

    /// The lane whose path ends on the prize slot.
    pub fn ladder_winning_lane(&self) -> Option<u8> {
        match self {
            Outcome::Ladder { paths, prize_slot } => paths
                .iter()
                .position(|slot| slot == prize_slot)
                .map(|lane| lane as u8),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), ChoiceError> {
        let valid = match self {
            Outcome::ColorWheel { segment } => *segment < WHEEL_SEGMENTS,
            Outcome::Dice { face } => (1..=DIE_FACES).contains(face),
            Outcome::Crash { crash_point_x100 } => {
                (100..=MAX_CRASH_X100).contains(crash_point_x100)
            }
            Outcome::Ladder { paths, prize_slot } => {
                let mut seen = [false; LADDER_LANES as usize];
                let permutation = paths.iter().all(|slot| {
                    let idx = *slot as usize;
                    idx < seen.len() && !std::mem::replace(&mut seen[idx], true)
                });
                permutation && *prize_slot < LADDER_LANES
            }
            Outcome::Race { winner } => *winner < RACE_RUNNERS,
        };
        if valid {
            Ok(())
        } else {
            Err(ChoiceError::MalformedOutcome(self.game()))
        }
    }
}

impl Write for Outcome {
    fn write(&self, writer: &mut impl BufMut) {
        self.game().write(writer);
        match self {
            Outcome::ColorWheel { segment } => segment.write(writer),
            Outcome::Dice { face } => face.write(writer),
            Outcome::Crash { crash_point_x100 } => crash_point_x100.write(writer),
            Outcome::Ladder { paths, prize_slot } => {
                for slot in paths {
                    slot.write(writer);
                }
                prize_slot.write(writer);
            }
            Outcome::Race { winner } => winner.write(writer),
        }
    }
}

impl Read for Outcome {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let outcome = match GameKind::read(reader)? {
            GameKind::ColorWheel => Outcome::ColorWheel {
                segment: u8::read(reader)?,
            },
            GameKind::Dice => Outcome::Dice {
                face: u8::read(reader)?,
            },
            GameKind::Crash => Outcome::Crash {
                crash_point_x100: u32::read(reader)?,
            },
            GameKind::Ladder => {
                let mut paths = [0u8; LADDER_LANES as usize];
                for slot in paths.iter_mut() {
                    *slot = u8::read(reader)?;
                }
                Outcome::Ladder {
                    paths,
                    prize_slot: u8::read(reader)?,
                }
            }
            GameKind::Race => Outcome::Race {
                winner: u8::read(reader)?,
            },
        };
        outcome
            .validate()
            .map_err(|_| Error::Invalid("Outcome", "malformed"))?;
        Ok(outcome)
    }
}

impl EncodeSize for Outcome {
    fn encode_size(&self) -> usize {
        u8::SIZE
            + match self {
                Outcome::ColorWheel { .. } | Outcome::Dice { .. } | Outcome::Race { .. } => {
                    u8::SIZE
                }
                Outcome::Crash { .. } => u32::SIZE,
                Outcome::Ladder { .. } => (LADDER_LANES as usize + 1) * u8::SIZE,
            }
    }
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum ChoiceError {
    #[error("unknown game: {0}")]
    UnknownGame(String),
    #[error("die face out of range (got={0}, max={max})", max = DIE_FACES)]
    FaceOutOfRange(u8),
    #[error("cash-out target out of range (got={0})")]
    CashOutOutOfRange(u32),
    #[error("ladder lane out of range (got={0}, lanes={lanes})", lanes = LADDER_LANES)]
    LaneOutOfRange(u8),
    #[error("race runner out of range (got={0}, runners={runners})", runners = RACE_RUNNERS)]
    RunnerOutOfRange(u8),
    #[error("a {choice} choice cannot settle a {outcome} outcome")]
    GameMismatch { choice: GameKind, outcome: GameKind },
    #[error("malformed {0} outcome")]
    MalformedOutcome(GameKind),
}
