//! Document keys and values held by the shared state store.

use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error, Read, ReadExt, Write};

use crate::game::GameKind;
use crate::ledger::{ProfitLogEntry, Treasury};
use crate::round::RoundRecord;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Round(GameKind),
    /// Highest round id ever issued for a game.
    RoundCounter(GameKind),
    Treasury,
    Balance(String),
    /// Position in the append-only profit log.
    ProfitLog(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum Value {
    Round(RoundRecord),
    RoundCounter(u64),
    Treasury(Treasury),
    Balance(u64),
    ProfitLog(ProfitLogEntry),
}

impl Write for Value {
    fn write(&self, writer: &mut impl BufMut) {
        match self {
            Self::Round(record) => {
                0u8.write(writer);
                record.write(writer);
            }
            Self::RoundCounter(counter) => {
                1u8.write(writer);
                counter.write(writer);
            }
            Self::Treasury(treasury) => {
                2u8.write(writer);
                treasury.write(writer);
            }
            Self::Balance(balance) => {
                3u8.write(writer);
                balance.write(writer);
            }
            Self::ProfitLog(entry) => {
                4u8.write(writer);
                entry.write(writer);
            }
        }
    }
}

impl Read for Value {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let value = match u8::read(reader)? {
            0 => Self::Round(RoundRecord::read(reader)?),
            1 => Self::RoundCounter(u64::read(reader)?),
            2 => Self::Treasury(Treasury::read(reader)?),
            3 => Self::Balance(u64::read(reader)?),
            4 => Self::ProfitLog(ProfitLogEntry::read(reader)?),
            i => return Err(Error::InvalidEnum(i)),
        };
        Ok(value)
    }
}

impl EncodeSize for Value {
    fn encode_size(&self) -> usize {
        1 + match self {
            Self::Round(record) => record.encode_size(),
            Self::RoundCounter(counter) => counter.encode_size(),
            Self::Treasury(treasury) => treasury.encode_size(),
            Self::Balance(balance) => balance.encode_size(),
            Self::ProfitLog(entry) => entry.encode_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_codec::{DecodeExt, Encode};

    #[test]
    fn value_tags_are_distinct() {
        let values = [
            Value::Round(RoundRecord::fresh(GameKind::Crash, 3, 0, 10_000)),
            Value::RoundCounter(3),
            Value::Treasury(Treasury { balance: 77 }),
            Value::Balance(1_000),
        ];
        for value in values {
            let encoded = value.encode();
            assert_eq!(encoded.len(), value.encode_size());
            assert_eq!(Value::decode(encoded.as_ref()).unwrap(), value);
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let bytes = [9u8, 0, 0];
        assert!(matches!(
            Value::decode(bytes.as_ref()),
            Err(Error::InvalidEnum(9))
        ));
    }
}
