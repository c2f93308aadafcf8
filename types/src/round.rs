use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error, FixedSize, Read, ReadExt, Write};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::codec::{read_len, read_string, string_encode_size, write_len, write_string};
use crate::game::{Choice, GameKind, Outcome};

pub const MAX_PARTICIPANT_ID_LENGTH: usize = 64;
pub const MAX_NICKNAME_LENGTH: usize = 32;
pub const MAX_ROUND_BETS: usize = 512;
pub const MAX_ROUND_WINNERS: usize = MAX_ROUND_BETS;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Betting = 0,
    Resolving = 1,
    Result = 2,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Betting => "betting",
            Phase::Resolving => "resolving",
            Phase::Result => "result",
        }
    }
}

impl TryFrom<u8> for Phase {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Phase::Betting),
            1 => Ok(Phase::Resolving),
            2 => Ok(Phase::Result),
            _ => Err(()),
        }
    }
}

impl Write for Phase {
    fn write(&self, writer: &mut impl BufMut) {
        (*self as u8).write(writer);
    }
}

impl Read for Phase {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let value = u8::read(reader)?;
        Phase::try_from(value).map_err(|_| Error::InvalidEnum(value))
    }
}

impl EncodeSize for Phase {
    fn encode_size(&self) -> usize {
        u8::SIZE
    }
}

/// Ledger key for a wager. Single-slot games always use slot 0.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BetKey {
    pub participant: String,
    pub slot: u8,
}

impl BetKey {
    pub fn new(participant: impl Into<String>, slot: u8) -> Self {
        Self {
            participant: participant.into(),
            slot,
        }
    }
}

impl Write for BetKey {
    fn write(&self, writer: &mut impl BufMut) {
        write_string(&self.participant, writer);
        self.slot.write(writer);
    }
}

impl Read for BetKey {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        Ok(Self {
            participant: read_string(reader, MAX_PARTICIPANT_ID_LENGTH)?,
            slot: u8::read(reader)?,
        })
    }
}

impl EncodeSize for BetKey {
    fn encode_size(&self) -> usize {
        string_encode_size(&self.participant) + self.slot.encode_size()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bet {
    pub amount: u64,
    pub choice: Choice,
    pub nickname: String,
    pub submitted_at_ms: u64,
}

impl Write for Bet {
    fn write(&self, writer: &mut impl BufMut) {
        self.amount.write(writer);
        self.choice.write(writer);
        write_string(&self.nickname, writer);
        self.submitted_at_ms.write(writer);
    }
}

impl Read for Bet {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        Ok(Self {
            amount: u64::read(reader)?,
            choice: Choice::read(reader)?,
            nickname: read_string(reader, MAX_NICKNAME_LENGTH)?,
            submitted_at_ms: u64::read(reader)?,
        })
    }
}

impl EncodeSize for Bet {
    fn encode_size(&self) -> usize {
        self.amount.encode_size()
            + self.choice.encode_size()
            + string_encode_size(&self.nickname)
            + self.submitted_at_ms.encode_size()
    }
}

/// A payout from the most recently completed round, kept for display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Winner {
    pub participant: String,
    pub nickname: String,
    pub amount: u64,
}

impl Write for Winner {
    fn write(&self, writer: &mut impl BufMut) {
        write_string(&self.participant, writer);
        write_string(&self.nickname, writer);
        self.amount.write(writer);
    }
}

impl Read for Winner {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        Ok(Self {
            participant: read_string(reader, MAX_PARTICIPANT_ID_LENGTH)?,
            nickname: read_string(reader, MAX_NICKNAME_LENGTH)?,
            amount: u64::read(reader)?,
        })
    }
}

impl EncodeSize for Winner {
    fn encode_size(&self) -> usize {
        string_encode_size(&self.participant)
            + string_encode_size(&self.nickname)
            + self.amount.encode_size()
    }
}

/// The shared document describing a game's current round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundRecord {
    pub game: GameKind,
    pub round_id: u64,
    pub status: Phase,
    pub phase_started_at_ms: u64,
    pub phase_deadline_ms: u64,
    pub bets: BTreeMap<BetKey, Bet>,
    pub outcome: Option<Outcome>,
    /// Pooled prize rolled into this round by a carry-over policy. Once the round
    /// is settled it holds the amount rolling into the next round instead.
    pub carry_over: u64,
    pub last_round_winners: Vec<Winner>,
}

impl RoundRecord {
    /// A new round in the Betting phase with an empty ledger.
    pub fn fresh(game: GameKind, round_id: u64, now_ms: u64, betting_ms: u64) -> Self {
        Self {
            game,
            round_id,
            status: Phase::Betting,
            phase_started_at_ms: now_ms,
            phase_deadline_ms: now_ms.saturating_add(betting_ms),
            bets: BTreeMap::new(),
            outcome: None,
            carry_over: 0,
            last_round_winners: Vec::new(),
        }
    }

    pub fn total_wagered(&self) -> u64 {
        self.bets
            .values()
            .fold(0u64, |total, bet| total.saturating_add(bet.amount))
    }

    pub fn is_betting_open(&self, now_ms: u64) -> bool {
        self.status == Phase::Betting && now_ms < self.phase_deadline_ms
    }

    pub fn bets_by<'a>(
        &'a self,
        participant: &'a str,
    ) -> impl Iterator<Item = (&'a BetKey, &'a Bet)> + 'a {
        self.bets
            .iter()
            .filter(move |(key, _)| key.participant == participant)
    }
}

impl Write for RoundRecord {
    fn write(&self, writer: &mut impl BufMut) {
        self.game.write(writer);
        self.round_id.write(writer);
        self.status.write(writer);
        self.phase_started_at_ms.write(writer);
        self.phase_deadline_ms.write(writer);
        write_len(self.bets.len(), writer);
        for (key, bet) in &self.bets {
            key.write(writer);
            bet.write(writer);
        }
        self.outcome.write(writer);
        self.carry_over.write(writer);
        write_len(self.last_round_winners.len(), writer);
        for winner in &self.last_round_winners {
            winner.write(writer);
        }
    }
}

impl Read for RoundRecord {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let game = GameKind::read(reader)?;
        let round_id = u64::read(reader)?;
        let status = Phase::read(reader)?;
        let phase_started_at_ms = u64::read(reader)?;
        let phase_deadline_ms = u64::read(reader)?;

        let bet_count = read_len(reader, MAX_ROUND_BETS, "RoundRecord")?;
        let mut bets = BTreeMap::new();
        for _ in 0..bet_count {
            let key = BetKey::read(reader)?;
            let bet = Bet::read(reader)?;
            if bet.choice.game() != game {
                return Err(Error::Invalid("RoundRecord", "bet for another game"));
            }
            if bets.insert(key, bet).is_some() {
                return Err(Error::Invalid("RoundRecord", "duplicate bet key"));
            }
        }

        let outcome = Option::<Outcome>::read(reader)?;
        if outcome.as_ref().is_some_and(|outcome| outcome.game() != game) {
            return Err(Error::Invalid("RoundRecord", "outcome for another game"));
        }
        let carry_over = u64::read(reader)?;

        let winner_count = read_len(reader, MAX_ROUND_WINNERS, "RoundRecord")?;
        let mut last_round_winners = Vec::with_capacity(winner_count);
        for _ in 0..winner_count {
            last_round_winners.push(Winner::read(reader)?);
        }

        Ok(Self {
            game,
            round_id,
            status,
            phase_started_at_ms,
            phase_deadline_ms,
            bets,
            outcome,
            carry_over,
            last_round_winners,
        })
    }
}

impl EncodeSize for RoundRecord {
    fn encode_size(&self) -> usize {
        self.game.encode_size()
            + self.round_id.encode_size()
            + self.status.encode_size()
            + self.phase_started_at_ms.encode_size()
            + self.phase_deadline_ms.encode_size()
            + u32::SIZE
            + self
                .bets
                .iter()
                .map(|(key, bet)| key.encode_size() + bet.encode_size())
                .sum::<usize>()
            + self.outcome.encode_size()
            + self.carry_over.encode_size()
            + u32::SIZE
            + self
                .last_round_winners
                .iter()
                .map(EncodeSize::encode_size)
                .sum::<usize>()
    }
}
