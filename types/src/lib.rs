//! Common types used throughout parlor.
//!
//! Everything here is plain data: the round record each game shares between
//! actors, the wagers it holds, the outcomes and payout tables of each game, and
//! the ledger documents the settlement writes. All stored documents implement the
//! `commonware-codec` traits so the store can keep them as versioned bytes.

pub mod codec;
pub mod game;
pub mod ledger;
pub mod round;
pub mod state;

pub use game::{
    ChoiceError, Choice, Color, DiceCall, GameKind, Multiplier, Outcome, PayoutModel, PhasePlan,
    ZeroWinnerPolicy,
};
pub use ledger::{ProfitLogEntry, Treasury};
pub use round::{Bet, BetKey, Phase, RoundRecord, Winner};
pub use state::{Key, Value};
