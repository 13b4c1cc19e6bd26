use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Error, Result, anyhow};

use crate::bencoding::Value;
use crate::core::{SHA1_LEN, Sha1};
use crate::torrent::DownloadType;

/// Immutable torrent descriptor, built from the bencoded info dictionary.
#[derive(Debug, PartialEq, Clone)]
pub struct Info {
    pub info_hash: Sha1,
    pub piece_size: usize,
    pub pieces: Vec<Sha1>,
    pub download_type: DownloadType,
    /// Canonical encoding of the info dictionary, served to peers fetching metadata.
    pub raw: Arc<Vec<u8>>,
}

/// A file of the torrent, positioned in the concatenated content.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FileEntry {
    /// Relative to the save directory.
    pub path: PathBuf,
    pub length: usize,
    pub offset: usize,
}

impl Info {
    fn build_pieces(pieces: &[u8]) -> Result<Vec<Sha1>> {
        if pieces.len() % SHA1_LEN != 0 {
            return Err(anyhow!(
                "invalid length {}. must be a multiple of {}",
                pieces.len(),
                SHA1_LEN
            ));
        }
        pieces.chunks_exact(SHA1_LEN).map(Sha1::from_slice).collect()
    }

    /// Parses metadata received from peers, checking it against the expected info hash.
    pub fn from_metadata(expected: Sha1, bytes: &[u8]) -> Result<Self> {
        let actual = Sha1::digest(bytes);
        if actual != expected {
            return Err(anyhow!("metadata hash {} does not match {}", actual, expected));
        }
        let info = Info::try_from(Value::from_bytes(bytes)?)?;
        if info.info_hash != expected {
            return Err(anyhow!("metadata is not canonically encoded"));
        }
        Ok(info)
    }

    pub fn name(&self) -> &str {
        self.download_type.name()
    }

    pub fn total_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece_size(&self, piece: usize) -> usize {
        let piece_start = self.piece_offset(piece);
        let piece_end = (piece_start + self.piece_size).min(self.total_size());
        piece_end.saturating_sub(piece_start)
    }

    pub fn piece_offset(&self, piece: usize) -> usize {
        self.piece_size * piece
    }

    pub fn total_size(&self) -> usize {
        self.download_type.total_size()
    }

    pub fn files(&self) -> Vec<FileEntry> {
        match &self.download_type {
            DownloadType::SingleFile { name, size, .. } => vec![FileEntry {
                path: PathBuf::from(name),
                length: *size,
                offset: 0,
            }],
            DownloadType::MultiFile {
                directory_name,
                files,
            } => {
                let mut offset = 0;
                files
                    .iter()
                    .map(|file| {
                        let entry = FileEntry {
                            path: PathBuf::from(directory_name).join(&file.path),
                            length: file.size,
                            offset,
                        };
                        offset += file.size;
                        entry
                    })
                    .collect()
            }
        }
    }
}

impl TryFrom<Value> for Info {
    type Error = Error;

    fn try_from(mut value: Value) -> Result<Self> {
        let raw = value.to_bytes();
        let info_hash = Sha1::digest(&raw);
        let piece_size: usize = value.remove_entry("piece length")?.try_into()?;
        if piece_size == 0 {
            return Err(anyhow!("piece length must be positive"));
        }
        let pieces: Vec<u8> = value.remove_entry("pieces")?.try_into()?;
        let pieces = Info::build_pieces(&pieces)?;
        let download_type: DownloadType = value.try_into()?;
        let expected_pieces = download_type.total_size().div_ceil(piece_size);
        if pieces.len() != expected_pieces {
            return Err(anyhow!(
                "expected {} piece hashes, got {}",
                expected_pieces,
                pieces.len()
            ));
        }
        Ok(Info {
            info_hash,
            piece_size,
            pieces,
            download_type,
            raw: Arc::new(raw),
        })
    }
}
