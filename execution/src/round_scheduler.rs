//! Round scheduler state machine.
//!
//! Pure phase logic shared by every actor: which phase follows which, how long
//! each lasts, and whether a record observed at `now_ms` is eligible to advance.
//! Nothing here touches the store.
//!
//! ## Phases
//!
//! A round cycles `Betting -> Resolving -> Result -> Betting` (a new round id on
//! the wrap). Games with an instantaneous outcome skip Resolving. The crash game
//! leaves Resolving when its live multiplier reaches the drawn crash point, with
//! `max_resolving_ms` as a fail-safe deadline.

use crate::outcome::live_multiplier_x100;
use parlor_types::{GameKind, Outcome, Phase, PhasePlan, RoundRecord};

/// Phase durations in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhaseConfig {
    pub betting_ms: u64,
    /// Duration of a timed Resolving phase.
    pub resolving_ms: u64,
    pub result_ms: u64,
    /// Fail-safe deadline for a continuous Resolving phase.
    pub max_resolving_ms: u64,
}

impl PhaseConfig {
    pub fn new(betting_ms: u64, resolving_ms: u64, result_ms: u64, max_resolving_ms: u64) -> Self {
        Self {
            betting_ms,
            resolving_ms,
            result_ms,
            max_resolving_ms,
        }
    }

    /// Durations the live tables run with unless configured otherwise.
    pub fn default_for(game: GameKind) -> Self {
        match game {
            GameKind::ColorWheel => Self::new(20_000, 0, 8_000, 0),
            GameKind::Dice => Self::new(15_000, 3_000, 6_000, 0),
            GameKind::Crash => Self::new(10_000, 0, 5_000, 120_000),
            GameKind::Ladder => Self::new(20_000, 5_000, 8_000, 0),
            GameKind::Race => Self::new(20_000, 10_000, 8_000, 0),
        }
    }

    /// Validate the durations the plan actually uses (all must be > 0).
    pub fn validate(&self, plan: PhasePlan) -> Result<(), &'static str> {
        if self.betting_ms == 0 {
            return Err("betting_ms must be greater than zero");
        }
        if self.result_ms == 0 {
            return Err("result_ms must be greater than zero");
        }
        match plan {
            PhasePlan::Merged => {}
            PhasePlan::Timed if self.resolving_ms == 0 => {
                return Err("resolving_ms must be greater than zero");
            }
            PhasePlan::Timed => {}
            PhasePlan::Continuous if self.max_resolving_ms == 0 => {
                return Err("max_resolving_ms must be greater than zero");
            }
            PhasePlan::Continuous => {}
        }
        Ok(())
    }

    pub fn duration_for_phase(&self, plan: PhasePlan, phase: Phase) -> u64 {
        match (phase, plan) {
            (Phase::Betting, _) => self.betting_ms,
            (Phase::Resolving, PhasePlan::Merged) => 0,
            (Phase::Resolving, PhasePlan::Timed) => self.resolving_ms,
            (Phase::Resolving, PhasePlan::Continuous) => self.max_resolving_ms,
            (Phase::Result, _) => self.result_ms,
        }
    }

    /// Longest a full cycle can take.
    pub fn cycle_duration_ms(&self, plan: PhasePlan) -> u64 {
        self.betting_ms
            .saturating_add(self.duration_for_phase(plan, Phase::Resolving))
            .saturating_add(self.result_ms)
    }
}

/// Result of a phase transition check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionResult {
    NoTransition,
    TransitionTo { phase: Phase, phase_ends_at_ms: u64 },
}

#[derive(Clone, Debug)]
pub struct RoundScheduler {
    game: GameKind,
    config: PhaseConfig,
}

impl RoundScheduler {
    pub fn new(game: GameKind, config: PhaseConfig) -> Self {
        Self { game, config }
    }

    pub fn game(&self) -> GameKind {
        self.game
    }

    pub fn config(&self) -> &PhaseConfig {
        &self.config
    }

    pub fn plan(&self) -> PhasePlan {
        self.game.phase_plan()
    }

    /// The phase following `phase`; Result wraps to a new round's Betting.
    pub fn next_phase(&self, phase: Phase) -> Phase {
        match (phase, self.plan().has_resolving()) {
            (Phase::Betting, true) => Phase::Resolving,
            (Phase::Betting, false) => Phase::Result,
            (Phase::Resolving, _) => Phase::Result,
            (Phase::Result, _) => Phase::Betting,
        }
    }

    /// Whether the live crash multiplier has reached the drawn crash point.
    pub fn has_crashed(&self, record: &RoundRecord, now_ms: u64) -> bool {
        match record.outcome {
            Some(Outcome::Crash { crash_point_x100 }) => {
                let elapsed = now_ms.saturating_sub(record.phase_started_at_ms);
                live_multiplier_x100(elapsed) >= crash_point_x100
            }
            _ => false,
        }
    }

    /// Whether `record` may leave its current phase at `now_ms`.
    pub fn is_due(&self, record: &RoundRecord, now_ms: u64) -> bool {
        if now_ms >= record.phase_deadline_ms {
            return true;
        }
        matches!(
            (self.plan(), record.status),
            (PhasePlan::Continuous, Phase::Resolving)
        ) && self.has_crashed(record, now_ms)
    }

    /// The phase `record` moves to at `now_ms` and when that phase ends, if due.
    pub fn check_transition(&self, record: &RoundRecord, now_ms: u64) -> TransitionResult {
        if !self.is_due(record, now_ms) {
            return TransitionResult::NoTransition;
        }
        let phase = self.next_phase(record.status);
        TransitionResult::TransitionTo {
            phase,
            phase_ends_at_ms: self.phase_end_time(phase, now_ms),
        }
    }

    pub fn phase_end_time(&self, phase: Phase, start_ms: u64) -> u64 {
        start_ms.saturating_add(self.config.duration_for_phase(self.plan(), phase))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(game: GameKind, status: Phase, started: u64, deadline: u64) -> RoundRecord {
        let mut record = RoundRecord::fresh(game, 1, started, 0);
        record.status = status;
        record.phase_deadline_ms = deadline;
        record
    }

    #[test]
    fn test_phase_config_validation() {
        let valid = PhaseConfig::default_for(GameKind::Dice);
        assert!(valid.validate(PhasePlan::Timed).is_ok());

        let mut invalid = valid;
        invalid.betting_ms = 0;
        assert_eq!(
            invalid.validate(PhasePlan::Timed),
            Err("betting_ms must be greater than zero")
        );

        // Merged games never read resolving_ms.
        let wheel = PhaseConfig::default_for(GameKind::ColorWheel);
        assert!(wheel.validate(PhasePlan::Merged).is_ok());
        assert!(wheel.validate(PhasePlan::Timed).is_err());

        let mut crash = PhaseConfig::default_for(GameKind::Crash);
        crash.max_resolving_ms = 0;
        assert_eq!(
            crash.validate(PhasePlan::Continuous),
            Err("max_resolving_ms must be greater than zero")
        );
    }

    #[test]
    fn test_default_configs_are_valid() {
        for game in GameKind::ALL {
            assert!(PhaseConfig::default_for(game).validate(game.phase_plan()).is_ok());
        }
    }

    #[test]
    fn test_next_phase_by_plan() {
        let dice = RoundScheduler::new(GameKind::Dice, PhaseConfig::default_for(GameKind::Dice));
        assert_eq!(dice.next_phase(Phase::Betting), Phase::Resolving);
        assert_eq!(dice.next_phase(Phase::Resolving), Phase::Result);
        assert_eq!(dice.next_phase(Phase::Result), Phase::Betting);

        let wheel = RoundScheduler::new(
            GameKind::ColorWheel,
            PhaseConfig::default_for(GameKind::ColorWheel),
        );
        assert_eq!(wheel.next_phase(Phase::Betting), Phase::Result);
        assert_eq!(wheel.next_phase(Phase::Result), Phase::Betting);
    }

    #[test]
    fn test_check_transition_at_deadline() {
        let scheduler = RoundScheduler::new(GameKind::Dice, PhaseConfig::default_for(GameKind::Dice));
        let betting = record(GameKind::Dice, Phase::Betting, 0, 15_000);

        assert_eq!(
            scheduler.check_transition(&betting, 14_999),
            TransitionResult::NoTransition
        );
        assert_eq!(
            scheduler.check_transition(&betting, 15_000),
            TransitionResult::TransitionTo {
                phase: Phase::Resolving,
                phase_ends_at_ms: 18_000,
            }
        );
    }

    #[test]
    fn test_crash_resolves_on_crossing() {
        let scheduler = RoundScheduler::new(GameKind::Crash, PhaseConfig::default_for(GameKind::Crash));
        let mut resolving = record(GameKind::Crash, Phase::Resolving, 100_000, 220_000);
        resolving.outcome = Some(Outcome::Crash {
            crash_point_x100: 200,
        });

        // 2.00x is reached after ln(2) / 0.00006 ms, roughly 11.55 s.
        assert!(!scheduler.is_due(&resolving, 100_000 + 11_000));
        assert!(scheduler.is_due(&resolving, 100_000 + 11_600));
    }

    #[test]
    fn test_crash_fail_safe_forces_resolution() {
        let scheduler = RoundScheduler::new(GameKind::Crash, PhaseConfig::default_for(GameKind::Crash));
        let resolving = record(GameKind::Crash, Phase::Resolving, 0, 120_000);
        // No outcome recorded: only the deadline can end the phase.
        assert!(!scheduler.is_due(&resolving, 119_999));
        assert!(scheduler.is_due(&resolving, 120_000));
    }

    #[test]
    fn test_crossing_only_applies_to_continuous_resolving() {
        let scheduler = RoundScheduler::new(GameKind::Crash, PhaseConfig::default_for(GameKind::Crash));
        let mut betting = record(GameKind::Crash, Phase::Betting, 0, 10_000);
        betting.outcome = Some(Outcome::Crash {
            crash_point_x100: 100,
        });
        assert!(!scheduler.is_due(&betting, 5_000));
    }

    #[test]
    fn test_cycle_duration() {
        let config = PhaseConfig::new(10, 20, 30, 40);
        assert_eq!(config.cycle_duration_ms(PhasePlan::Merged), 40);
        assert_eq!(config.cycle_duration_ms(PhasePlan::Timed), 60);
        assert_eq!(config.cycle_duration_ms(PhasePlan::Continuous), 80);
    }
}
