mod retry;
mod safe_write;

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{RelayError, RelayResult};
use crate::layout::quarantine_path;

pub use retry::{is_transient, retry_transient};
pub use safe_write::{SafeFileWriter, WriteMode};

/// Reads and parses a JSON record. Parse failures come back as
/// `CorruptRecord` so callers can quarantine the file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> RelayResult<T> {
    let bytes = retry_transient(path, || fs::read(path))?;
    serde_json::from_slice(&bytes).map_err(|err| RelayError::corrupt(path, err.to_string()))
}

/// Canonical on-disk encoding: pretty JSON plus a trailing newline. Equal
/// values always produce identical bytes.
pub fn encode_record<T: Serialize>(path: &Path, value: &T) -> RelayResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value)
        .map_err(|err| RelayError::io(path, std::io::Error::new(std::io::ErrorKind::InvalidData, err)))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Moves a file that failed validation out of the way (`x.json` ->
/// `x.json.invalid`) instead of deleting it.
pub fn quarantine(path: &Path) -> RelayResult<PathBuf> {
    let target = quarantine_path(path);
    retry_transient(path, || fs::rename(path, &target))?;
    Ok(target)
}
