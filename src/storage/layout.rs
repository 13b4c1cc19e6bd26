use std::io::{ErrorKind, Result, SeekFrom};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::torrent::Info;

/// Maps byte ranges of the torrent content onto the files under the save directory.
#[derive(Debug, Clone)]
pub struct FileLayout {
    root: PathBuf,
    files: Vec<LayoutFile>,
}

#[derive(Debug, Clone)]
struct LayoutFile {
    path: PathBuf,
    length: usize,
    offset: usize,
}

/// Part of a byte range that falls into one file.
#[derive(Debug, PartialEq, Eq)]
pub struct Span<'a> {
    pub path: &'a Path,
    pub file_offset: u64,
    pub length: usize,
}

impl FileLayout {
    pub fn new(save_path: &Path, info: &Info) -> Self {
        let files = info
            .files()
            .into_iter()
            .map(|entry| LayoutFile {
                path: save_path.join(entry.path),
                length: entry.length,
                offset: entry.offset,
            })
            .collect();
        // Top level entry: the file itself, or the torrent's directory
        let root = save_path.join(info.name());
        Self { root, files }
    }

    pub fn spans(&self, offset: usize, length: usize) -> Vec<Span<'_>> {
        let end = offset + length;
        self.files
            .iter()
            .filter(|file| file.length > 0)
            .filter(|file| file.offset < end && offset < file.offset + file.length)
            .map(|file| {
                let start = offset.max(file.offset);
                let stop = end.min(file.offset + file.length);
                Span {
                    path: &file.path,
                    file_offset: (start - file.offset) as u64,
                    length: stop - start,
                }
            })
            .collect()
    }

    /// Creates missing directories and files. Existing data is kept.
    pub async fn allocate(&self) -> Result<()> {
        for file in &self.files {
            if let Some(parent) = file.path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let handle = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&file.path)
                .await?;
            if handle.metadata().await?.len() < file.length as u64 {
                handle.set_len(file.length as u64).await?;
            }
        }
        Ok(())
    }

    /// Returns `None` if any file the range touches does not exist.
    pub async fn read(&self, offset: usize, length: usize) -> Result<Option<Vec<u8>>> {
        let mut data = Vec::with_capacity(length);
        for span in self.spans(offset, length) {
            let mut file = match fs::File::open(span.path).await {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
                Err(err) => return Err(err),
            };
            file.seek(SeekFrom::Start(span.file_offset)).await?;
            let start = data.len();
            data.resize(start + span.length, 0);
            if let Err(err) = file.read_exact(&mut data[start..]).await {
                if err.kind() == ErrorKind::UnexpectedEof {
                    return Ok(None);
                }
                return Err(err);
            }
        }
        Ok(Some(data))
    }

    pub async fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut written = 0;
        for span in self.spans(offset, data.len()) {
            let mut file = OpenOptions::new()
                .write(true)
                .truncate(false)
                .open(span.path)
                .await?;
            file.seek(SeekFrom::Start(span.file_offset)).await?;
            file.write_all(&data[written..written + span.length]).await?;
            file.flush().await?;
            written += span.length;
        }
        Ok(())
    }

    pub async fn delete(&self) -> Result<()> {
        for file in &self.files {
            match fs::remove_file(&file.path).await {
                Ok(()) => debug!("deleted {}", file.path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => (),
                Err(err) => return Err(err),
            }
        }
        if fs::metadata(&self.root).await.is_ok_and(|metadata| metadata.is_dir()) {
            if let Err(err) = fs::remove_dir_all(&self.root).await {
                warn!("unable to remove {}: {}", self.root.display(), err);
            }
        }
        Ok(())
    }
}
