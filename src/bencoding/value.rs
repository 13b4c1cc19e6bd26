use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Error, Result, anyhow};

use crate::core::{Md5, Sha1};

#[derive(Debug, PartialEq, Clone)]
pub enum Value {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<Value>),
    Dictionary(BTreeMap<String, Value>),
}

impl Value {
    pub fn string(str: &str) -> Self {
        Self::String(str.as_bytes().to_vec())
    }

    pub fn list() -> Self {
        Self::List(Vec::new())
    }

    pub fn dictionary() -> Self {
        Self::Dictionary(BTreeMap::new())
    }

    pub fn with_value(mut self, value: Value) -> Self {
        if let Self::List(values) = &mut self {
            values.push(value);
        }
        self
    }

    pub fn with_entry(mut self, key: &str, value: Value) -> Self {
        if let Self::Dictionary(entries) = &mut self {
            entries.insert(key.to_string(), value);
        }
        self
    }

    /// Removes a required entry from a dictionary.
    pub fn remove_entry(&mut self, key: &str) -> Result<Value> {
        self.try_remove_entry(key)?
            .ok_or_else(|| anyhow!("missing entry \"{}\"", key))
    }

    /// Removes an optional entry from a dictionary. Fails if the value is not a dictionary.
    pub fn try_remove_entry(&mut self, key: &str) -> Result<Option<Value>> {
        match self {
            Self::Dictionary(entries) => Ok(entries.remove(key)),
            _ => Err(anyhow!("value is not a dictionary")),
        }
    }

    pub fn get_entry(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Dictionary(entries) => entries.get(key),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        self.encode(&mut buffer)
            .expect("writing to a vec never fails");
        buffer
    }
}

impl From<&Value> for Sha1 {
    /// Hash of the canonical encoding, used for the info hash.
    fn from(value: &Value) -> Self {
        Sha1::digest(&value.to_bytes())
    }
}

impl TryFrom<Value> for Vec<u8> {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::String(bytes) => Ok(bytes),
            _ => Err(anyhow!("value is not a string")),
        }
    }
}

impl TryFrom<Value> for String {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        let bytes: Vec<u8> = value.try_into()?;
        Ok(String::from_utf8(bytes)?)
    }
}

impl TryFrom<Value> for i64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Integer(integer) => Ok(integer),
            _ => Err(anyhow!("value is not an integer")),
        }
    }
}

impl TryFrom<Value> for usize {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        let integer: i64 = value.try_into()?;
        Ok(usize::try_from(integer)?)
    }
}

impl TryFrom<Value> for u64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        let integer: i64 = value.try_into()?;
        Ok(u64::try_from(integer)?)
    }
}

impl TryFrom<Value> for u16 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        let integer: i64 = value.try_into()?;
        Ok(u16::try_from(integer)?)
    }
}

impl TryFrom<Value> for Duration {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        let seconds: u64 = value.try_into()?;
        Ok(Duration::from_secs(seconds))
    }
}

impl TryFrom<Value> for Vec<Value> {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::List(values) => Ok(values),
            _ => Err(anyhow!("value is not a list")),
        }
    }
}

impl TryFrom<Value> for Md5 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        let hex: String = value.try_into()?;
        let mut bytes = [0; 16];
        hex::decode_to_slice(hex, &mut bytes)?;
        Ok(Md5(bytes))
    }
}
