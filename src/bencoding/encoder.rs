use std::io::{Result, Write};

use crate::bencoding::value::Value;

impl Value {
    /// Writes the canonical encoding (dictionary keys in sorted order).
    pub fn encode(&self, dest: &mut impl Write) -> Result<()> {
        match self {
            Self::String(bytes) => write_bytes(bytes, dest),
            Self::Integer(integer) => write!(dest, "i{integer}e"),
            Self::List(values) => {
                dest.write_all(b"l")?;
                values.iter().try_for_each(|value| value.encode(dest))?;
                dest.write_all(b"e")
            }
            Self::Dictionary(entries) => {
                dest.write_all(b"d")?;
                for (key, value) in entries {
                    write_bytes(key.as_bytes(), dest)?;
                    value.encode(dest)?;
                }
                dest.write_all(b"e")
            }
        }
    }

    /// Length of the canonical encoding, without encoding.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::String(bytes) => prefixed_len(bytes.len()),
            Self::Integer(integer) => integer.to_string().len() + 2,
            Self::List(values) => 2 + values.iter().map(Value::encoded_len).sum::<usize>(),
            Self::Dictionary(entries) => {
                2 + entries
                    .iter()
                    .map(|(key, value)| prefixed_len(key.len()) + value.encoded_len())
                    .sum::<usize>()
            }
        }
    }
}

fn write_bytes(bytes: &[u8], dest: &mut impl Write) -> Result<()> {
    write!(dest, "{}:", bytes.len())?;
    dest.write_all(bytes)
}

fn prefixed_len(len: usize) -> usize {
    len.to_string().len() + 1 + len
}
