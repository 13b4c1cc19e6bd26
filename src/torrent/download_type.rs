use std::path::{Component, Path, PathBuf};

use anyhow::{Error, Result, anyhow};

use crate::{bencoding::Value, core::Md5};

#[derive(Debug, PartialEq, Clone)]
pub enum DownloadType {
    SingleFile {
        name: String,
        size: usize,
        md5sum: Option<Md5>,
    },
    MultiFile {
        directory_name: String,
        files: Vec<File>,
    },
}

impl DownloadType {
    pub fn name(&self) -> &str {
        match self {
            Self::SingleFile { name, .. } => name,
            Self::MultiFile { directory_name, .. } => directory_name,
        }
    }

    pub fn total_size(&self) -> usize {
        match self {
            Self::SingleFile { size, .. } => *size,
            Self::MultiFile { files, .. } => files.iter().map(|file| file.size).sum(),
        }
    }
}

impl TryFrom<Value> for DownloadType {
    type Error = Error;

    fn try_from(mut value: Value) -> Result<Self> {
        let name: String = value.remove_entry("name")?.try_into()?;
        ensure_safe(Path::new(&name))?;

        if let Some(length) = value.try_remove_entry("length")? {
            let md5sum = match value.try_remove_entry("md5sum")? {
                Some(value) => Some(value.try_into()?),
                None => None,
            };
            return Ok(DownloadType::SingleFile {
                name,
                size: length.try_into()?,
                md5sum,
            });
        }

        if let Some(files) = value.try_remove_entry("files")? {
            let files: Vec<Value> = files.try_into()?;
            let files = files
                .into_iter()
                .map(File::try_from)
                .collect::<Result<Vec<_>>>()?;
            return Ok(DownloadType::MultiFile {
                directory_name: name,
                files,
            });
        }

        Err(anyhow!("info dictionary has neither \"length\" nor \"files\""))
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct File {
    pub path: PathBuf,
    pub size: usize,
    pub md5sum: Option<Md5>,
}

impl TryFrom<Value> for File {
    type Error = Error;

    fn try_from(mut value: Value) -> Result<Self> {
        let size = value.remove_entry("length")?.try_into()?;
        let parts: Vec<Value> = value.remove_entry("path")?.try_into()?;
        let mut path = PathBuf::with_capacity(parts.len());
        for part in parts {
            let part: String = part.try_into()?;
            path.push(part);
        }
        ensure_safe(&path)?;
        let md5sum = match value.try_remove_entry("md5sum")? {
            Some(value) => Some(value.try_into()?),
            None => None,
        };
        Ok(File { size, path, md5sum })
    }
}

/// Paths from a descriptor must stay inside the save directory.
fn ensure_safe(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(anyhow!("empty path"));
    }
    for component in path.components() {
        match component {
            Component::Normal(part) if !part.to_string_lossy().contains(['/', '\\']) => (),
            _ => return Err(anyhow!("unsafe path {:?}", path)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &[&str]) -> Value {
        let path = path
            .iter()
            .fold(Value::list(), |list, part| list.with_value(Value::string(part)));
        Value::dictionary()
            .with_entry("length", Value::Integer(12))
            .with_entry("path", path)
    }

    #[test]
    fn single_file() {
        let value = Value::dictionary()
            .with_entry("name", Value::string("image.iso"))
            .with_entry("length", Value::Integer(5678))
            .with_entry("md5sum", Value::string("5d41402abc4b2a76b9719d911017c592"));

        let download_type = DownloadType::try_from(value).unwrap();

        assert_eq!(download_type.name(), "image.iso");
        assert_eq!(download_type.total_size(), 5678);
    }

    #[test]
    fn multi_file() {
        let value = Value::dictionary()
            .with_entry("name", Value::string("root"))
            .with_entry(
                "files",
                Value::list()
                    .with_value(file(&["dir", "file1"]))
                    .with_value(file(&["file2"])),
            );

        let download_type = DownloadType::try_from(value).unwrap();

        if let DownloadType::MultiFile { files, .. } = &download_type {
            assert_eq!(files[0].path, PathBuf::from("dir/file1"));
            assert_eq!(files[1].path, PathBuf::from("file2"));
        } else {
            panic!("unexpected download type");
        }
        assert_eq!(download_type.total_size(), 24);
    }

    #[test]
    fn reject_parent_directory() {
        let value = Value::dictionary()
            .with_entry("name", Value::string("root"))
            .with_entry(
                "files",
                Value::list().with_value(file(&["..", "..", "etc", "passwd"])),
            );

        assert!(DownloadType::try_from(value).is_err());
    }

    #[test]
    fn reject_separator_in_name() {
        let value = Value::dictionary()
            .with_entry("name", Value::string("/etc/passwd"))
            .with_entry("length", Value::Integer(1));

        assert!(DownloadType::try_from(value).is_err());
    }
}
