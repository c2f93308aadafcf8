use parlor_execution::{BetLimits, PhaseConfig};
use parlor_types::GameKind;
use serde::Deserialize;
use std::{collections::BTreeMap, net::SocketAddr, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::Level;

fn default_listen() -> String {
    "0.0.0.0:9123".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_actors() -> usize {
    4
}

fn default_tick_ms() -> u64 {
    1_000
}

fn default_max_jitter_ms() -> u64 {
    2_000
}

fn default_starting_balance() -> u64 {
    10_000
}

fn default_max_attempts() -> usize {
    3
}

fn default_refund_attempts() -> usize {
    5
}

fn default_broadcast_capacity() -> usize {
    1_024
}

fn default_bot_interval_ms() -> u64 {
    3_000
}

fn default_bot_max_stake() -> u64 {
    250
}

/// Per-game overrides; anything left out keeps the game's default.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GameSettings {
    pub betting_ms: Option<u64>,
    pub resolving_ms: Option<u64>,
    pub result_ms: Option<u64>,
    pub max_resolving_ms: Option<u64>,
    pub min_bet: Option<u64>,
    pub max_bet: Option<u64>,
    pub max_bets_per_round: Option<usize>,
}

impl GameSettings {
    fn phase_config(&self, game: GameKind) -> PhaseConfig {
        let defaults = PhaseConfig::default_for(game);
        PhaseConfig {
            betting_ms: self.betting_ms.unwrap_or(defaults.betting_ms),
            resolving_ms: self.resolving_ms.unwrap_or(defaults.resolving_ms),
            result_ms: self.result_ms.unwrap_or(defaults.result_ms),
            max_resolving_ms: self.max_resolving_ms.unwrap_or(defaults.max_resolving_ms),
        }
    }

    fn limits(&self) -> BetLimits {
        let defaults = BetLimits::default();
        BetLimits {
            min_bet: self.min_bet.unwrap_or(defaults.min_bet),
            max_bet: self.max_bet.unwrap_or(defaults.max_bet),
            max_bets_per_round: self.max_bets_per_round.unwrap_or(defaults.max_bets_per_round),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BotConfig {
    #[serde(default)]
    pub count: usize,
    #[serde(default = "default_bot_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_bot_max_stake")]
    pub max_stake: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            count: 0,
            interval_ms: default_bot_interval_ms(),
            max_stake: default_bot_max_stake(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Independent in-process actors, each driving every game.
    #[serde(default = "default_actors")]
    pub actors: usize,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
    #[serde(default = "default_starting_balance")]
    pub starting_balance: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_refund_attempts")]
    pub refund_attempts: usize,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default)]
    pub games: BTreeMap<GameKind, GameSettings>,
    #[serde(default)]
    pub bots: BotConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            log_level: default_log_level(),
            actors: default_actors(),
            tick_ms: default_tick_ms(),
            max_jitter_ms: default_max_jitter_ms(),
            starting_balance: default_starting_balance(),
            max_attempts: default_max_attempts(),
            refund_attempts: default_refund_attempts(),
            broadcast_capacity: default_broadcast_capacity(),
            games: BTreeMap::new(),
            bots: BotConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen address: {value}")]
    InvalidListen {
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("invalid log level: {value}")]
    InvalidLogLevel { value: String },
    #[error("{field} must be > 0 (got {value})")]
    InvalidNonZero { field: &'static str, value: u64 },
    #[error("{game}: {reason}")]
    InvalidGame { game: GameKind, reason: &'static str },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GameConfig {
    pub phases: PhaseConfig,
    pub limits: BetLimits,
}

#[derive(Clone, Debug)]
pub struct BotSettings {
    pub count: usize,
    pub interval: Duration,
    pub max_stake: u64,
}

pub struct ValidatedConfig {
    pub listen: SocketAddr,
    pub log_level: Level,
    pub actors: usize,
    pub tick: Duration,
    pub max_jitter: Duration,
    pub starting_balance: u64,
    pub max_attempts: usize,
    pub refund_attempts: usize,
    pub broadcast_capacity: usize,
    pub games: BTreeMap<GameKind, GameConfig>,
    pub bots: BotSettings,
}

fn ensure_nonzero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidNonZero { field, value });
    }
    Ok(())
}

impl Config {
    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        let listen = self
            .listen
            .parse::<SocketAddr>()
            .map_err(|source| ConfigError::InvalidListen {
                value: self.listen.clone(),
                source,
            })?;
        let log_level =
            Level::from_str(&self.log_level).map_err(|_| ConfigError::InvalidLogLevel {
                value: self.log_level.clone(),
            })?;
        ensure_nonzero("actors", self.actors as u64)?;
        ensure_nonzero("tick_ms", self.tick_ms)?;
        ensure_nonzero("starting_balance", self.starting_balance)?;
        ensure_nonzero("max_attempts", self.max_attempts as u64)?;
        ensure_nonzero("refund_attempts", self.refund_attempts as u64)?;
        ensure_nonzero("broadcast_capacity", self.broadcast_capacity as u64)?;
        if self.bots.count > 0 {
            ensure_nonzero("bots.interval_ms", self.bots.interval_ms)?;
            ensure_nonzero("bots.max_stake", self.bots.max_stake)?;
        }

        let mut games = BTreeMap::new();
        for game in GameKind::ALL {
            let settings = self.games.get(&game).cloned().unwrap_or_default();
            let phases = settings.phase_config(game);
            phases
                .validate(game.phase_plan())
                .map_err(|reason| ConfigError::InvalidGame { game, reason })?;
            let limits = settings.limits();
            limits
                .validate()
                .map_err(|reason| ConfigError::InvalidGame { game, reason })?;
            games.insert(game, GameConfig { phases, limits });
        }

        Ok(ValidatedConfig {
            listen,
            log_level,
            actors: self.actors,
            tick: Duration::from_millis(self.tick_ms),
            max_jitter: Duration::from_millis(self.max_jitter_ms),
            starting_balance: self.starting_balance,
            max_attempts: self.max_attempts,
            refund_attempts: self.refund_attempts,
            broadcast_capacity: self.broadcast_capacity,
            games,
            bots: BotSettings {
                count: self.bots.count,
                interval: Duration::from_millis(self.bots.interval_ms),
                max_stake: self.bots.max_stake,
            },
        })
    }
}
