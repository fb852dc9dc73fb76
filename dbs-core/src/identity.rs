//! File identity: the protocol-level name of a backed-up file.
//!
//! A file ID hashes the file name and its modification time, not its
//! contents. Two files with identical bytes get different IDs; editing a file
//! changes its ID.

use std::path::Path;
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};

use crate::protocol::FileId;

#[derive(Debug, thiserror::Error)]
pub enum FileIdError {
    #[error("path has no file name")]
    NoFileName,
    #[error("cannot read file metadata: {0}")]
    Metadata(#[from] std::io::Error),
}

/// SHA-256 over `file_name ++ mtime_millis`, as a `FileId`.
pub fn gen_file_id(path: &Path) -> Result<FileId, FileIdError> {
    let name = path
        .file_name()
        .ok_or(FileIdError::NoFileName)?
        .to_string_lossy();
    let modified = std::fs::metadata(path)?.modified()?;
    let millis = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    Ok(file_id_from_parts(&name, millis))
}

/// Digest of an already-resolved (name, modification time) pair.
pub fn file_id_from_parts(file_name: &str, modified_millis: u128) -> FileId {
    let mut hasher = Sha256::new();
    hasher.update(file_name.as_bytes());
    hasher.update(modified_millis.to_string().as_bytes());
    FileId::from_digest(hasher.finalize().into())
}
