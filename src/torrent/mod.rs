mod download_type;
mod info;
mod magnet;

use std::path::{Path, PathBuf};

use anyhow::{Error, Result};
use log::warn;
use url::Url;

use crate::bencoding::Value;

pub use download_type::*;
pub use info::*;
pub use magnet::*;

const MAGNET_PREFIX: &str = "magnet:";

/// A parsed `.torrent` file: descriptor plus tracker tiers flattened in order.
#[derive(Debug, PartialEq, Clone)]
pub struct Torrent {
    pub trackers: Vec<Url>,
    pub info: Info,
}

impl Torrent {
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Torrent::try_from(Value::from_bytes(&bytes)?)
    }
}

impl TryFrom<Value> for Torrent {
    type Error = Error;

    fn try_from(mut value: Value) -> Result<Self> {
        let mut announce_urls: Vec<String> = Vec::new();
        if let Some(announce) = value.try_remove_entry("announce")? {
            announce_urls.push(announce.try_into()?);
        }
        if let Some(tiers) = value.try_remove_entry("announce-list")? {
            let tiers: Vec<Value> = tiers.try_into()?;
            for tier in tiers {
                let tier: Vec<Value> = tier.try_into()?;
                for url in tier {
                    announce_urls.push(url.try_into()?);
                }
            }
        }

        let mut trackers: Vec<Url> = Vec::with_capacity(announce_urls.len());
        for url in announce_urls {
            match Url::parse(&url) {
                Ok(url) if !trackers.contains(&url) => trackers.push(url),
                Ok(_) => (),
                Err(err) => warn!("ignoring invalid tracker url {}: {}", url, err),
            }
        }

        let info = value.remove_entry("info")?.try_into()?;
        Ok(Torrent { trackers, info })
    }
}

/// Where a torrent descriptor comes from.
#[derive(Debug, Clone)]
pub enum DescriptorSource {
    File(PathBuf),
    Magnet(MagnetLink),
    Torrent(Torrent),
}

impl DescriptorSource {
    /// `magnet:` URIs become magnet links, anything else is treated as a path.
    pub fn parse(source: &str) -> Result<Self> {
        if source.starts_with(MAGNET_PREFIX) {
            Ok(Self::Magnet(MagnetLink::parse(source)?))
        } else {
            Ok(Self::File(PathBuf::from(source)))
        }
    }
}

impl From<Torrent> for DescriptorSource {
    fn from(torrent: Torrent) -> Self {
        Self::Torrent(torrent)
    }
}

#[cfg(test)]
pub mod tests {
    use crate::core::Sha1;

    use super::*;

    pub fn info_value(piece_size: usize, content: &[u8]) -> Value {
        let pieces: Vec<u8> = content
            .chunks(piece_size)
            .flat_map(|piece| Sha1::digest(piece).0)
            .collect();
        Value::dictionary()
            .with_entry("piece length", Value::Integer(piece_size as i64))
            .with_entry("pieces", Value::String(pieces))
            .with_entry("name", Value::string("test.bin"))
            .with_entry("length", Value::Integer(content.len() as i64))
    }

    /// Single-file descriptor with valid hashes for `content`.
    pub fn test_info(piece_size: usize, content: &[u8]) -> Info {
        Info::try_from(info_value(piece_size, content)).expect("invalid test info")
    }

    pub fn test_torrent(piece_size: usize, content: &[u8]) -> Torrent {
        Torrent {
            trackers: Vec::new(),
            info: test_info(piece_size, content),
        }
    }

    #[test]
    fn valid_torrent_metainfo() {
        let metainfo = Value::dictionary()
            .with_entry(
                "announce",
                Value::string("http://tracker.example.com/announce"),
            )
            .with_entry(
                "announce-list",
                Value::list()
                    .with_value(
                        Value::list()
                            .with_value(Value::string("http://tracker.example.com/announce")),
                    )
                    .with_value(
                        Value::list()
                            .with_value(Value::string("udp://tracker.opentrackr.org:1337"))
                            .with_value(Value::string("not a url")),
                    ),
            )
            .with_entry("info", info_value(4, b"hello world"));

        let torrent = Torrent::try_from(metainfo).expect("invalid metainfo");

        assert_eq!(
            torrent
                .trackers
                .iter()
                .map(Url::as_str)
                .collect::<Vec<_>>(),
            vec![
                "http://tracker.example.com/announce",
                "udp://tracker.opentrackr.org:1337"
            ]
        );
        assert_eq!(torrent.info.total_pieces(), 3);
        assert_eq!(torrent.info.name(), "test.bin");
    }

    #[test]
    fn missing_info() {
        let metainfo = Value::dictionary().with_entry(
            "announce",
            Value::string("http://tracker.example.com/announce"),
        );

        assert!(Torrent::try_from(metainfo).is_err());
    }

    #[tokio::test]
    async fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.torrent");
        let metainfo = Value::dictionary().with_entry("info", info_value(4, b"hello world"));
        tokio::fs::write(&path, metainfo.to_bytes()).await.unwrap();

        let torrent = Torrent::load(&path).await.unwrap();

        assert!(torrent.trackers.is_empty());
        assert_eq!(torrent.info, test_info(4, b"hello world"));
    }

    #[test]
    fn parse_source() {
        let magnet = "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a";

        assert!(matches!(
            DescriptorSource::parse(magnet).unwrap(),
            DescriptorSource::Magnet(_)
        ));
        assert!(matches!(
            DescriptorSource::parse("/tmp/file.torrent").unwrap(),
            DescriptorSource::File(_)
        ));
    }
}
