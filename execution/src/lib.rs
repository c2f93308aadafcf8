//! Parlor execution layer.
//!
//! This crate drives wagering rounds without a coordinator. Every actor runs the
//! same [RoundController] against a shared versioned [Store]; phase transitions
//! are optimistic transactions, so among any number of actors attempting the
//! same boundary exactly one commit lands and the payouts it carries are
//! applied exactly once.
//!
//! ## Transition invariants
//! - A transition re-reads the round inside its transaction and aborts unless
//!   the round id and phase match what the actor observed.
//! - Outcomes are drawn inside the transaction that reveals them; a retried
//!   attempt draws again and only the committed draw is ever visible.
//! - Settlement credits, the treasury credit and the profit log entry are staged
//!   on the same transaction as the phase change.
//! - Round ids come from a per-game counter written with every new round, so a
//!   reinitialised round never reuses an id.
//! - Ledger iteration uses ordered maps; payouts never depend on hash order.
//!
//! ## Minimal lifecycle (example)
//! ```rust,ignore
//! use parlor_execution::{open_account, BetRequest, Memory, Registrar, RoundController, SystemClock, TracingNotifier};
//! use parlor_types::{Choice, Color, GameKind};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = Arc::new(Memory::new());
//! open_account(&*store, "alice", 1_000)?;
//! let mut controller = RoundController::new("actor-0", store.clone(), SystemClock, TracingNotifier);
//! controller.tick(GameKind::ColorWheel).await?; // creates round 1
//! let registrar = Registrar::new(store, SystemClock);
//! registrar.place_bet(BetRequest {
//!     game: GameKind::ColorWheel,
//!     participant: "alice".into(),
//!     nickname: "Alice".into(),
//!     slot: 0,
//!     amount: 100,
//!     choice: Choice::ColorWheel { color: Color::Red },
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod controller;
pub mod mediator;
pub mod notify;
pub mod outcome;
pub mod registrar;
pub mod round_scheduler;
pub mod settlement;
pub mod store;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

#[cfg(test)]
mod race_tests;

pub use clock::{Clock, SystemClock};
pub use controller::{ControllerError, RoundController, TickOutcome, Transition};
pub use mediator::{Mediation, Mediator, PhaseMark};
pub use notify::{ChannelNotifier, Notice, Notifier, TracingNotifier};
pub use registrar::{BetError, BetLimits, BetRequest, Receipt, Registrar, Rejection};
pub use round_scheduler::{PhaseConfig, RoundScheduler, TransitionResult};
pub use settlement::{Payout, Settlement, SettlementError};
pub use store::{
    open_account, profit_log_len, read_balance, read_profit_log, read_round, read_treasury, transaction,
    Balances, Document, Memory, Mutation, ReadSet, Store, StoreError, Txn, TxnError, Version,
};
