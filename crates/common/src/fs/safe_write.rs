use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use path_clean::PathClean;
use uuid::Uuid;

use crate::error::{RelayError, RelayResult};
use crate::fs::encode_record;
use crate::fs::retry::retry_transient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Temp file + fsync + rename over the target. Readers only ever see the
    /// old or the new content.
    Atomic,
    /// Same, but fails when the target already exists.
    CreateNew,
}

/// Writes record files under a fixed set of base directories.
#[derive(Debug, Clone)]
pub struct SafeFileWriter {
    allowed_base_dirs: Vec<PathBuf>,
    max_file_size: Option<usize>,
}

impl SafeFileWriter {
    pub fn new(allowed_base_dirs: Vec<PathBuf>) -> Self {
        Self {
            allowed_base_dirs: allowed_base_dirs.into_iter().map(|dir| dir.clean()).collect(),
            max_file_size: Some(10 * 1024 * 1024), // 10MB default max
        }
    }

    pub fn with_max_size(mut self, max_size: Option<usize>) -> Self {
        self.max_file_size = max_size;
        self
    }

    fn validate_path(&self, path: &Path) -> RelayResult<()> {
        if path
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            return Err(RelayError::io(
                path,
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "path contains parent directory traversal",
                ),
            ));
        }

        let cleaned = path.clean();
        if !self
            .allowed_base_dirs
            .iter()
            .any(|base| cleaned.starts_with(base))
        {
            return Err(RelayError::io(
                path,
                io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "path is outside of allowed directories",
                ),
            ));
        }

        Ok(())
    }

    fn validate_content(&self, path: &Path, content: &[u8]) -> RelayResult<()> {
        if let Some(max_size) = self.max_file_size {
            if content.len() > max_size {
                return Err(RelayError::io(
                    path,
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("content size {} exceeds maximum {} bytes", content.len(), max_size),
                    ),
                ));
            }
        }
        Ok(())
    }

    pub fn write(&self, path: &Path, content: &[u8], mode: WriteMode) -> RelayResult<()> {
        self.validate_path(path)?;
        self.validate_content(path, content)?;

        let parent = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|err| RelayError::io(parent, err))?;

        if mode == WriteMode::CreateNew && path.exists() {
            return Err(RelayError::io(
                path,
                io::Error::new(io::ErrorKind::AlreadyExists, "target already exists"),
            ));
        }

        retry_transient(path, || write_atomic(parent, path, content, mode))
    }

    pub fn write_json<T: serde::Serialize>(
        &self,
        path: &Path,
        value: &T,
        mode: WriteMode,
    ) -> RelayResult<()> {
        let bytes = encode_record(path, value)?;
        self.write(path, &bytes, mode)
    }
}

/// Hidden temp name in the target directory so the rename never crosses a
/// filesystem and watchers filtering on `*.json` ignore it.
fn temp_path_for(parent: &Path, path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    parent.join(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}

fn write_atomic(parent: &Path, path: &Path, content: &[u8], mode: WriteMode) -> io::Result<()> {
    let temp_path = temp_path_for(parent, path);
    let result = (|| {
        let mut temp = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        temp.write_all(content)?;
        temp.sync_all()?;
        drop(temp);

        match mode {
            WriteMode::Atomic => fs::rename(&temp_path, path)?,
            // hard_link refuses to replace an existing target
            WriteMode::CreateNew => {
                fs::hard_link(&temp_path, path)?;
                fs::remove_file(&temp_path)?;
            }
        }
        sync_dir(parent)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
