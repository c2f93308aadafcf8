//! Length-prefixed helpers shared by the document codecs.
//!
//! Every variable-length field carries a `u32` prefix and is bounded on read so a
//! corrupt document can never make the decoder allocate without limit.

use bytes::{Buf, BufMut};
use commonware_codec::{Error, ReadExt, Write};

/// Write a string as a `u32` length followed by its UTF-8 bytes.
pub fn write_string(s: &str, writer: &mut impl BufMut) {
    let bytes = s.as_bytes();
    (bytes.len() as u32).write(writer);
    writer.put_slice(bytes);
}

/// Read a length-prefixed UTF-8 string of at most `max_len` bytes.
pub fn read_string(reader: &mut impl Buf, max_len: usize) -> Result<String, Error> {
    let len = u32::read(reader)? as usize;
    if len > max_len {
        return Err(Error::Invalid("String", "too long"));
    }
    if reader.remaining() < len {
        return Err(Error::EndOfBuffer);
    }
    let mut bytes = vec![0u8; len];
    reader.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| Error::Invalid("String", "invalid UTF-8"))
}

pub fn string_encode_size(s: &str) -> usize {
    4 + s.len()
}

/// Write a collection length prefix.
pub fn write_len(len: usize, writer: &mut impl BufMut) {
    (len as u32).write(writer);
}

/// Read a collection length prefix, rejecting anything above `max`.
pub fn read_len(reader: &mut impl Buf, max: usize, what: &'static str) -> Result<usize, Error> {
    let len = u32::read(reader)? as usize;
    if len > max {
        return Err(Error::Invalid(what, "too many entries"));
    }
    Ok(len)
}
