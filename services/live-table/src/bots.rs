use crate::config::BotSettings;
use parlor_execution::{
    open_account, read_balance, read_round, Balances, BetError, BetRequest, Clock, Memory,
    Registrar, SystemClock,
};
use parlor_types::{
    game::{DIE_FACES, LADDER_LANES, MIN_CASH_OUT_X100, RACE_RUNNERS},
    Choice, Color, DiceCall, GameKind,
};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use std::sync::Arc;
use tokio::{sync::watch, time};
use tracing::{debug, info, warn};

const BOT_CASH_OUT_MAX_X100: u32 = 500;

pub fn bot_ids(count: usize) -> Vec<String> {
    (0..count).map(|idx| format!("bot-{idx:03}")).collect()
}

pub fn random_choice(game: GameKind, rng: &mut impl Rng) -> Choice {
    match game {
        GameKind::ColorWheel => {
            let color = *[Color::Red, Color::Black, Color::Green]
                .choose(rng)
                .unwrap_or(&Color::Red);
            Choice::ColorWheel { color }
        }
        GameKind::Dice => {
            let call = match rng.gen_range(0..3) {
                0 => DiceCall::Odd,
                1 => DiceCall::Even,
                _ => DiceCall::Face(rng.gen_range(1..=DIE_FACES)),
            };
            Choice::Dice { call }
        }
        GameKind::Crash => Choice::Crash {
            cash_out_x100: rng.gen_range(MIN_CASH_OUT_X100..=BOT_CASH_OUT_MAX_X100),
        },
        GameKind::Ladder => Choice::Ladder {
            lane: rng.gen_range(0..LADDER_LANES),
        },
        GameKind::Race => Choice::Race {
            runner: rng.gen_range(0..RACE_RUNNERS),
        },
    }
}

/// Tops `bot` back up to `starting_balance` once it can no longer cover `max_stake`.
fn refill(store: &Memory, bot: &str, starting_balance: u64, max_stake: u64) {
    match read_balance(store, bot) {
        Ok(Some(balance)) if balance < max_stake => {
            let delta = starting_balance.saturating_sub(balance).min(i64::MAX as u64) as i64;
            if let Err(err) = store.atomic_adjust(bot, delta) {
                warn!(%bot, ?err, "bot refill failed");
            }
        }
        Ok(_) => {}
        Err(err) => warn!(%bot, ?err, "bot balance unreadable"),
    }
}

/// Place a handful of random wagers on whichever rounds are taking bets.
pub async fn run(
    store: Arc<Memory>,
    registrar: Arc<Registrar<Memory, SystemClock>>,
    settings: BotSettings,
    starting_balance: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let bots = bot_ids(settings.count);
    for bot in &bots {
        if let Err(err) = open_account(&*store, bot, starting_balance) {
            warn!(%bot, ?err, "failed to open bot account");
        }
    }
    info!(count = bots.len(), "bots started");

    let mut rng = StdRng::from_entropy();
    let mut interval = time::interval(settings.interval);
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
        let now_ms = SystemClock.now_ms();
        for bot in &bots {
            let Some(&game) = GameKind::ALL.choose(&mut rng) else {
                continue;
            };
            match read_round(&*store, game) {
                Ok(Some((_, record))) if record.is_betting_open(now_ms) => {}
                _ => continue,
            }
            refill(&store, bot, starting_balance, settings.max_stake);
            let limits = registrar.limits(game);
            let ceiling = settings.max_stake.min(limits.max_bet).max(limits.min_bet);
            let request = BetRequest {
                game,
                participant: bot.clone(),
                nickname: bot.clone(),
                slot: rng.gen_range(0..game.slots()),
                amount: rng.gen_range(limits.min_bet..=ceiling),
                choice: random_choice(game, &mut rng),
            };
            match registrar.place_bet(request) {
                Ok(receipt) => debug!(%bot, %game, round_id = receipt.round_id, stake = receipt.stake, "bot bet"),
                // Random picks regularly collide with an earlier pick on the same slot.
                Err(BetError::ChoiceConflict | BetError::BettingClosed | BetError::TooManyBets) => {}
                Err(err) => debug!(%bot, %game, ?err, "bot bet refused"),
            }
        }
    }
    debug!("bots stopped");
}
