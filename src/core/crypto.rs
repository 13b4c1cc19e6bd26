use std::fmt::{Debug, Display, Formatter};

use anyhow::{Result, anyhow};
use sha1::Digest;

pub const SHA1_LEN: usize = 20;

#[derive(PartialEq, Eq, Hash, Clone, Copy)]
pub struct Sha1(pub [u8; SHA1_LEN]);

impl Sha1 {
    pub fn digest(data: &[u8]) -> Self {
        Self(sha1::Sha1::digest(data).into())
    }

    pub fn from_hex(str: &str) -> Result<Self> {
        let mut bytes = [0; SHA1_LEN];
        hex::decode_to_slice(str, &mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; SHA1_LEN] = bytes
            .try_into()
            .map_err(|_| anyhow!("expected {} bytes, got {}", SHA1_LEN, bytes.len()))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Debug for Sha1 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sha1({})", self.to_hex())
    }
}

impl Display for Sha1 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(PartialEq, Eq, Clone)]
pub struct Md5(pub [u8; 16]);

impl Debug for Md5 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Md5({})", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest() {
        assert_eq!(
            Sha1::digest(b"hello").to_hex(),
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
    }

    #[test]
    fn invalid_hex() {
        assert!(Sha1::from_hex("not hex").is_err());
        assert!(Sha1::from_hex("aaf4").is_err());
    }
}
