use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error, Read, ReadExt, Write};

use crate::game::{GameKind, BPS_DENOMINATOR};

/// The house's accumulated share of wagered funds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Treasury {
    pub balance: u64,
}

impl Write for Treasury {
    fn write(&self, writer: &mut impl BufMut) {
        self.balance.write(writer);
    }
}

impl Read for Treasury {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        Ok(Self {
            balance: u64::read(reader)?,
        })
    }
}

impl EncodeSize for Treasury {
    fn encode_size(&self) -> usize {
        self.balance.encode_size()
    }
}

/// Append-only audit entry written once per settled round that had wagers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProfitLogEntry {
    pub game: GameKind,
    pub round_id: u64,
    /// Signed house result for the round (negative when fixed payouts exceed the stake).
    pub amount: i64,
    pub fee_bps: u16,
    pub total_wagered: u64,
    pub total_paid: u64,
    pub timestamp_ms: u64,
}

impl ProfitLogEntry {
    pub fn fee_rate(&self) -> f64 {
        self.fee_bps as f64 / BPS_DENOMINATOR as f64
    }

    /// Stable reference to the round this entry settles.
    pub fn round_ref(&self) -> String {
        format!("{}-{}", self.game, self.round_id)
    }
}

impl Write for ProfitLogEntry {
    fn write(&self, writer: &mut impl BufMut) {
        self.game.write(writer);
        self.round_id.write(writer);
        self.amount.write(writer);
        self.fee_bps.write(writer);
        self.total_wagered.write(writer);
        self.total_paid.write(writer);
        self.timestamp_ms.write(writer);
    }
}

impl Read for ProfitLogEntry {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        Ok(Self {
            game: GameKind::read(reader)?,
            round_id: u64::read(reader)?,
            amount: i64::read(reader)?,
            fee_bps: u16::read(reader)?,
            total_wagered: u64::read(reader)?,
            total_paid: u64::read(reader)?,
            timestamp_ms: u64::read(reader)?,
        })
    }
}

impl EncodeSize for ProfitLogEntry {
    fn encode_size(&self) -> usize {
        self.game.encode_size()
            + self.round_id.encode_size()
            + self.amount.encode_size()
            + self.fee_bps.encode_size()
            + self.total_wagered.encode_size()
            + self.total_paid.encode_size()
            + self.timestamp_ms.encode_size()
    }
}
