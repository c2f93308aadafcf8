//! Outcome generation for each game.
//!
//! Outcomes are drawn from fresh randomness inside the transaction that reveals
//! them. A retried transaction draws again; only the committed draw counts.

use parlor_types::{
    game::{DIE_FACES, LADDER_LANES, MAX_CRASH_X100, RACE_RUNNERS, WHEEL_SEGMENTS},
    GameKind, Outcome, Phase,
};
use rand::{seq::SliceRandom, Rng};

/// Growth rate of the crash multiplier per millisecond.
const CRASH_GROWTH_PER_MS: f64 = 0.000_06;

/// The phase whose entering transaction draws the outcome.
pub fn reveal_phase(game: GameKind) -> Phase {
    match game {
        GameKind::Crash => Phase::Resolving,
        _ => Phase::Result,
    }
}

pub fn draw<R: Rng + ?Sized>(game: GameKind, rng: &mut R) -> Outcome {
    match game {
        GameKind::ColorWheel => Outcome::ColorWheel {
            segment: rng.gen_range(0..WHEEL_SEGMENTS),
        },
        GameKind::Dice => Outcome::Dice {
            face: rng.gen_range(1..=DIE_FACES),
        },
        GameKind::Crash => Outcome::Crash {
            crash_point_x100: crash_point_x100(rng.gen::<f64>()),
        },
        GameKind::Ladder => {
            let mut paths = [0u8; LADDER_LANES as usize];
            for (lane, slot) in paths.iter_mut().enumerate() {
                *slot = lane as u8;
            }
            paths.shuffle(rng);
            Outcome::Ladder {
                paths,
                prize_slot: rng.gen_range(0..LADDER_LANES),
            }
        }
        GameKind::Race => Outcome::Race {
            winner: rng.gen_range(0..RACE_RUNNERS),
        },
    }
}

/// Map a uniform sample in `[0, 1)` to a crash point in hundredths.
///
/// `floor(99 / (1 - r))` gives a 1% chance of crashing at 1.00x.
pub fn crash_point_x100(sample: f64) -> u32 {
    let sample = if sample.is_finite() {
        sample.clamp(0.0, 1.0 - f64::EPSILON)
    } else {
        0.0
    };
    let point = (99.0 / (1.0 - sample)).floor();
    if point >= MAX_CRASH_X100 as f64 {
        MAX_CRASH_X100
    } else {
        (point as u32).max(100)
    }
}

/// The live crash multiplier, in hundredths, `elapsed_ms` into Resolving.
pub fn live_multiplier_x100(elapsed_ms: u64) -> u32 {
    let value = (100.0 * (CRASH_GROWTH_PER_MS * elapsed_ms as f64).exp()).floor();
    if value >= MAX_CRASH_X100 as f64 {
        MAX_CRASH_X100
    } else {
        value as u32
    }
}
