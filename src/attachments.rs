use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{BufReader, Read},
    path::PathBuf,
};
use thiserror::Error;
use uuid::Uuid;

/// Opaque handle to a stored upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileRef(String);

impl FileRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("attachment `{0}` not found")]
    NotFound(String),
    #[error("attachment io failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("no file attached")]
    Missing,
    #[error("file is {size} bytes, the limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("only .csv files can be imported")]
    NotCsv,
}

/// Storage for uploaded files.
///
/// `open` may be called repeatedly; each call reads the file from the start.
pub trait AttachmentStore: Send + Sync {
    fn put(&self, filename: &str, bytes: &[u8]) -> Result<FileRef, AttachmentError>;
    fn open(&self, file: &FileRef) -> Result<Box<dyn Read + Send>, AttachmentError>;
    fn remove(&self, file: &FileRef) -> Result<(), AttachmentError>;
}

pub fn validate_upload(filename: &str, bytes: &[u8], max_bytes: usize) -> Result<(), UploadError> {
    if bytes.is_empty() {
        return Err(UploadError::Missing);
    }
    if bytes.len() > max_bytes {
        return Err(UploadError::TooLarge {
            size: bytes.len(),
            limit: max_bytes,
        });
    }
    let is_csv = filename
        .rsplit_once('.')
        .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case("csv"));
    if !is_csv {
        return Err(UploadError::NotCsv);
    }
    Ok(())
}

/// Attachments kept as files below a root directory.
pub struct LocalAttachments {
    root: PathBuf,
}

impl LocalAttachments {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, AttachmentError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, file: &FileRef) -> PathBuf {
        self.root.join(file.as_str())
    }
}

impl AttachmentStore for LocalAttachments {
    fn put(&self, filename: &str, bytes: &[u8]) -> Result<FileRef, AttachmentError> {
        let file = FileRef::new(format!("{}-{}", Uuid::new_v4().simple(), safe_name(filename)));
        fs::write(self.path_for(&file), bytes)?;
        Ok(file)
    }

    fn open(&self, file: &FileRef) -> Result<Box<dyn Read + Send>, AttachmentError> {
        match fs::File::open(self.path_for(file)) {
            Ok(handle) => Ok(Box::new(BufReader::new(handle))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(AttachmentError::NotFound(file.as_str().to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn remove(&self, file: &FileRef) -> Result<(), AttachmentError> {
        match fs::remove_file(self.path_for(file)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn safe_name(filename: &str) -> String {
    let name: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let name = name.trim_start_matches('.');
    if name.is_empty() {
        "upload.csv".to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
pub use memory::MemoryAttachments;
