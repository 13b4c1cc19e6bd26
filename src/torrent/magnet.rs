use std::net::SocketAddr;

use anyhow::{Result, anyhow};
use log::warn;
use url::Url;

use crate::core::{SHA1_LEN, Sha1};

const BTIH_PREFIX: &str = "urn:btih:";

/// `magnet:?xt=urn:btih:<hash>&dn=<name>&tr=<tracker>&x.pe=<host:port>`
#[derive(Debug, PartialEq, Clone)]
pub struct MagnetLink {
    pub info_hash: Sha1,
    pub display_name: Option<String>,
    pub trackers: Vec<Url>,
    pub peers: Vec<SocketAddr>,
}

impl MagnetLink {
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri)?;
        if url.scheme() != "magnet" {
            return Err(anyhow!("not a magnet link: {}", uri));
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        let mut peers = Vec::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    if let Some(hash) = value.strip_prefix(BTIH_PREFIX) {
                        info_hash = Some(parse_info_hash(hash)?);
                    }
                }
                "dn" => display_name = Some(value.into_owned()),
                "tr" => match Url::parse(&value) {
                    Ok(tracker) => trackers.push(tracker),
                    Err(err) => warn!("ignoring invalid tracker {}: {}", value, err),
                },
                "x.pe" => match value.parse() {
                    Ok(addr) => peers.push(addr),
                    Err(err) => warn!("ignoring invalid peer address {}: {}", value, err),
                },
                _ => (),
            }
        }

        let info_hash = info_hash.ok_or_else(|| anyhow!("missing urn:btih info hash"))?;
        Ok(Self {
            info_hash,
            display_name,
            trackers,
            peers,
        })
    }
}

fn parse_info_hash(hash: &str) -> Result<Sha1> {
    match hash.len() {
        40 => Sha1::from_hex(hash),
        32 => base32_decode(hash)
            .ok_or_else(|| anyhow!("invalid base32 info hash {}", hash))
            .and_then(|bytes| Sha1::from_slice(&bytes)),
        _ => Err(anyhow!("invalid info hash length {}", hash.len())),
    }
}

/// RFC 4648 alphabet, no padding.
fn base32_decode(input: &str) -> Option<Vec<u8>> {
    let mut output = Vec::with_capacity(SHA1_LEN);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for char in input.bytes() {
        let value = match char.to_ascii_uppercase() {
            c @ b'A'..=b'Z' => c - b'A',
            c @ b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        buffer = (buffer << 5) | value as u32;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            output.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }
    Some(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";

    #[test]
    fn hex_info_hash() {
        let uri = format!(
            "magnet:?xt=urn:btih:{}&dn=Some+Name&tr=http%3A%2F%2Ftracker.example.com%2Fannounce",
            HEX
        );

        let magnet = MagnetLink::parse(&uri).unwrap();

        assert_eq!(magnet.info_hash.to_hex(), HEX);
        assert_eq!(magnet.display_name.as_deref(), Some("Some Name"));
        assert_eq!(
            magnet.trackers,
            vec![Url::parse("http://tracker.example.com/announce").unwrap()]
        );
    }

    #[test]
    fn base32_info_hash() {
        let uri = "magnet:?xt=urn:btih:YEX6DQDLXISUVHOJ6UM3GNNKPQJWPKEK";

        let magnet = MagnetLink::parse(uri).unwrap();

        assert_eq!(magnet.info_hash.to_hex(), HEX);
    }

    #[test]
    fn peer_addresses() {
        let uri = format!(
            "magnet:?xt=urn:btih:{}&x.pe=127.0.0.1:6881&x.pe=not-an-address",
            HEX
        );

        let magnet = MagnetLink::parse(&uri).unwrap();

        assert_eq!(magnet.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn missing_info_hash() {
        assert!(MagnetLink::parse("magnet:?dn=foo").is_err());
    }

    #[test]
    fn invalid_info_hash_length() {
        assert!(MagnetLink::parse("magnet:?xt=urn:btih:abcd").is_err());
    }
}
