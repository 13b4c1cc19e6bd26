use std::collections::BTreeMap;
use std::io::{Error, ErrorKind, Result, Write};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::bencoding::value::Value;
use crate::core::AsyncDecoder;

const READ_CHUNK: usize = 8 * 1024;

/// Strings announced longer than this are still accepted, only their buffer starts smaller.
const MAX_PREALLOCATION: usize = 64 * 1024;

impl AsyncDecoder for Value {
    async fn decode<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Self> {
        let mut parser = Parser::new();
        let mut chunk = vec![0; READ_CHUNK];
        loop {
            let read = stream.read(&mut chunk).await?;
            if read == 0 {
                return parser.result();
            }
            parser.write_all(&chunk[..read])?;
        }
    }
}

impl Value {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut parser = Parser::new();
        parser.write_all(bytes)?;
        parser.result()
    }

    /// Decodes the value at the start of `bytes` and returns how many bytes it spans. Used for
    /// messages where raw data follows a bencoded header.
    pub fn decode_prefix(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut parser = Parser::new();
        for (position, byte) in bytes.iter().enumerate() {
            parser.push(*byte)?;
            if let Token::Complete(_) = parser.token {
                return Ok((parser.result()?, position + 1));
            }
        }
        Err(incomplete())
    }
}

/// Incremental bencode parser. Bytes are written in as they arrive, in chunks of any size;
/// [`Parser::result`] returns the value once it is complete.
#[derive(Debug)]
pub struct Parser {
    token: Token,
    /// Lists and dictionaries still open, innermost last
    open: Vec<Container>,
    consumed: usize,
}

/// What the parser is in the middle of reading.
#[derive(Debug)]
enum Token {
    /// Start of the next value, or the end of the current container
    Expecting,
    Integer(Vec<u8>),
    /// Length prefix of a string, up to the colon
    Length(usize),
    Bytes { data: Vec<u8>, remaining: usize },
    Complete(Value),
}

#[derive(Debug)]
enum Container {
    List(Vec<Value>),
    /// A pending key waits for its value
    Dictionary(BTreeMap<String, Value>, Option<String>),
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            token: Token::Expecting,
            open: Vec::new(),
            consumed: 0,
        }
    }

    pub fn result(self) -> Result<Value> {
        match self.token {
            Token::Complete(value) => Ok(value),
            _ => Err(incomplete()),
        }
    }

    fn push(&mut self, byte: u8) -> Result<()> {
        match &mut self.token {
            Token::Expecting => self.start(byte)?,
            Token::Integer(digits) => match byte {
                b'e' => {
                    let integer = parse_integer(digits)?;
                    self.finish(Value::Integer(integer))?;
                }
                b'-' | b'0'..=b'9' => digits.push(byte),
                _ => return Err(self.unexpected(byte)),
            },
            Token::Length(length) => match byte {
                b'0'..=b'9' => {
                    *length = length
                        .checked_mul(10)
                        .and_then(|length| length.checked_add(usize::from(byte - b'0')))
                        .ok_or_else(|| invalid("string length overflows"))?;
                }
                b':' if *length == 0 => self.finish(Value::String(Vec::new()))?,
                b':' => {
                    let remaining = *length;
                    self.token = Token::Bytes {
                        data: Vec::with_capacity(remaining.min(MAX_PREALLOCATION)),
                        remaining,
                    };
                }
                _ => return Err(self.unexpected(byte)),
            },
            Token::Bytes { data, remaining } => {
                data.push(byte);
                *remaining -= 1;
                if *remaining == 0 {
                    let data = std::mem::take(data);
                    self.finish(Value::String(data))?;
                }
            }
            // Files saved by some tools end with a newline
            Token::Complete(_) if byte.is_ascii_whitespace() => (),
            Token::Complete(_) => return Err(self.unexpected(byte)),
        }
        self.consumed += 1;
        Ok(())
    }

    fn start(&mut self, byte: u8) -> Result<()> {
        match byte {
            b'i' => self.token = Token::Integer(Vec::new()),
            b'l' => self.open.push(Container::List(Vec::new())),
            b'd' => self.open.push(Container::Dictionary(BTreeMap::new(), None)),
            b'0'..=b'9' => self.token = Token::Length(usize::from(byte - b'0')),
            b'e' => self.close()?,
            _ => return Err(self.unexpected(byte)),
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        match self.open.pop() {
            Some(Container::List(values)) => self.finish(Value::List(values)),
            Some(Container::Dictionary(entries, None)) => self.finish(Value::Dictionary(entries)),
            Some(Container::Dictionary(_, Some(key))) => {
                Err(invalid(format!("no value for key \"{}\"", key)))
            }
            None => Err(invalid(format!("unmatched end at position {}", self.consumed))),
        }
    }

    /// Places a complete value into the innermost container, or makes it the result.
    fn finish(&mut self, value: Value) -> Result<()> {
        self.token = Token::Expecting;
        match self.open.last_mut() {
            None => self.token = Token::Complete(value),
            Some(Container::List(values)) => values.push(value),
            Some(Container::Dictionary(entries, pending)) => match (pending.take(), value) {
                (Some(key), value) => {
                    entries.insert(key, value);
                }
                (None, Value::String(key)) => {
                    let key = String::from_utf8(key)
                        .map_err(|_| invalid("dictionary key is not utf8"))?;
                    *pending = Some(key);
                }
                (None, _) => return Err(invalid("dictionary keys must be strings")),
            },
        }
        Ok(())
    }

    fn unexpected(&self, byte: u8) -> Error {
        invalid(format!(
            "unexpected byte 0x{:02x} at position {}",
            byte, self.consumed
        ))
    }
}

impl Write for Parser {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        buf.iter().try_for_each(|byte| self.push(*byte))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidData, reason.into())
}

fn incomplete() -> Error {
    Error::new(ErrorKind::UnexpectedEof, "incomplete bencoded value")
}

/// Integers are canonical: no leading zeros, no negative zero.
fn parse_integer(digits: &[u8]) -> Result<i64> {
    let (negative, magnitude) = match digits.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, digits),
    };
    match magnitude {
        [] => Err(invalid("empty integer")),
        _ if magnitude.contains(&b'-') => Err(invalid("misplaced minus sign")),
        [b'0', _, ..] => Err(invalid("integer with leading zero")),
        [b'0'] if negative => Err(invalid("negative zero")),
        _ => std::str::from_utf8(digits)
            .ok()
            .and_then(|text| text.parse().ok())
            .ok_or_else(|| invalid("integer out of range")),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    async fn decode(input: &[u8]) -> Result<Value> {
        Value::decode(&mut Cursor::new(input.to_vec())).await
    }

    #[tokio::test]
    async fn decode_metainfo_like_dictionary() {
        let input = b"d8:announce23:http://tracker/announce4:infod6:lengthi12e4:name8:file.bin12:piece lengthi16384eee";

        let value = decode(input).await.unwrap();

        let info = Value::dictionary()
            .with_entry("length", Value::Integer(12))
            .with_entry("name", Value::string("file.bin"))
            .with_entry("piece length", Value::Integer(16384));
        let expected = Value::dictionary()
            .with_entry("announce", Value::string("http://tracker/announce"))
            .with_entry("info", info);
        assert_eq!(value, expected);
    }

    #[tokio::test]
    async fn strings_may_hold_binary_data() {
        let value = decode(b"4:\x00\xff\x10e").await.unwrap();

        assert_eq!(value, Value::String(vec![0x00, 0xff, 0x10, b'e']));
    }

    #[tokio::test]
    async fn empty_containers_and_strings() {
        let value = decode(b"d0:lee").await.unwrap();

        assert_eq!(value, Value::dictionary().with_entry("", Value::list()));
    }

    #[tokio::test]
    async fn integers() {
        assert_eq!(decode(b"i0e").await.unwrap(), Value::Integer(0));
        assert_eq!(decode(b"i-42e").await.unwrap(), Value::Integer(-42));
        assert_eq!(
            decode(b"i9223372036854775807e").await.unwrap(),
            Value::Integer(i64::MAX)
        );
    }

    #[tokio::test]
    async fn reject_non_canonical_integers() {
        for input in [&b"i-0e"[..], b"i03e", b"ie", b"i1-2e", b"i99999999999999999999e"] {
            assert!(decode(input).await.is_err(), "accepted {:?}", input);
        }
    }

    #[tokio::test]
    async fn reject_malformed_structures() {
        for input in [&b"di1ei2ee"[..], b"d3:fooe", b"e", b"x", b"i1ei2e"] {
            assert!(decode(input).await.is_err(), "accepted {:?}", input);
        }
    }

    #[tokio::test]
    async fn truncated_input_is_incomplete() {
        let err = decode(b"l4:spa").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn trailing_newline_is_ignored() {
        assert_eq!(decode(b"le\n").await.unwrap(), Value::list());
    }

    #[test]
    fn values_split_across_writes() {
        let mut parser = Parser::new();

        parser.write_all(b"l5:he").unwrap();
        parser.write_all(b"llo").unwrap();
        parser.write_all(b"i7ee").unwrap();

        let expected = Value::list()
            .with_value(Value::string("hello"))
            .with_value(Value::Integer(7));
        assert_eq!(parser.result().unwrap(), expected);
    }

    #[test]
    fn decode_prefix_leaves_trailing_data() {
        let (value, length) = Value::decode_prefix(b"d5:piecei0eeRAW").unwrap();

        assert_eq!(value, Value::dictionary().with_entry("piece", Value::Integer(0)));
        assert_eq!(length, 12);
    }

    #[test]
    fn decode_prefix_of_incomplete_value() {
        assert!(Value::decode_prefix(b"d5:piece").is_err());
    }
}
