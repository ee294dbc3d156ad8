//! On-disk layout shared by workers, producers and monitors.
//!
//! ```text
//! tasks/W/<taskID>.json          pending task
//! tasks/W/.inprogress-<taskID>   claim marker
//! tasks/W/.archive/<taskID>.json archived task
//! results/W/<taskID>.json        terminal result
//! heartbeats/W.json              heartbeat record
//! pipes/W-control                control FIFO
//! pipes/W-status                 status FIFO
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

pub const TASK_EXTENSION: &str = "json";
pub const CLAIM_PREFIX: &str = ".inprogress-";
pub const QUARANTINE_SUFFIX: &str = ".invalid";
const ARCHIVE_DIR: &str = ".archive";
const LOCK_FILE: &str = ".lock";

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("valid regex"));

/// Worker ids and task ids share one naming rule: no leading dot, no path
/// separators.
pub fn is_valid_identifier(value: &str) -> bool {
    IDENTIFIER.is_match(value)
}

/// `t1.json` -> `Some("t1")`. Hidden files (producer temp files, claim
/// markers) and quarantined files never match.
pub fn task_id_from_file_name(name: &str) -> Option<&str> {
    let stem = name.strip_suffix(TASK_EXTENSION)?.strip_suffix('.')?;
    is_valid_identifier(stem).then_some(stem)
}

/// `.inprogress-t1` -> `Some("t1")`.
pub fn task_id_from_marker_name(name: &str) -> Option<&str> {
    let id = name.strip_prefix(CLAIM_PREFIX)?;
    is_valid_identifier(id).then_some(id)
}

/// `t1.json` -> `t1.json.invalid`.
pub fn quarantine_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(QUARANTINE_SUFFIX);
    path.with_file_name(name)
}

/// Root directories, one per record kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub task_dir: PathBuf,
    pub result_dir: PathBuf,
    pub heartbeat_dir: PathBuf,
    pub pipe_dir: PathBuf,
}

impl Layout {
    pub fn under(root: &Path) -> Self {
        Self {
            task_dir: root.join("tasks"),
            result_dir: root.join("results"),
            heartbeat_dir: root.join("heartbeats"),
            pipe_dir: root.join("pipes"),
        }
    }

    pub fn worker(&self, worker: &str) -> WorkerPaths {
        WorkerPaths {
            worker: worker.to_string(),
            pending_dir: self.task_dir.join(worker),
            result_dir: self.result_dir.join(worker),
            heartbeat_file: self
                .heartbeat_dir
                .join(format!("{}.{}", worker, TASK_EXTENSION)),
            control_pipe: self.pipe_dir.join(format!("{}-control", worker)),
            status_pipe: self.pipe_dir.join(format!("{}-status", worker)),
        }
    }

    /// Directories every process may write into.
    pub fn roots(&self) -> Vec<PathBuf> {
        vec![
            self.task_dir.clone(),
            self.result_dir.clone(),
            self.heartbeat_dir.clone(),
            self.pipe_dir.clone(),
        ]
    }
}

/// Paths owned by a single worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPaths {
    pub worker: String,
    pub pending_dir: PathBuf,
    pub result_dir: PathBuf,
    pub heartbeat_file: PathBuf,
    pub control_pipe: PathBuf,
    pub status_pipe: PathBuf,
}

impl WorkerPaths {
    pub fn task_file(&self, task_id: &str) -> PathBuf {
        self.pending_dir
            .join(format!("{}.{}", task_id, TASK_EXTENSION))
    }

    pub fn claim_marker(&self, task_id: &str) -> PathBuf {
        self.pending_dir.join(format!("{}{}", CLAIM_PREFIX, task_id))
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.pending_dir.join(ARCHIVE_DIR)
    }

    pub fn archived_task(&self, task_id: &str) -> PathBuf {
        self.archive_dir()
            .join(format!("{}.{}", task_id, TASK_EXTENSION))
    }

    pub fn result_file(&self, task_id: &str) -> PathBuf {
        self.result_dir
            .join(format!("{}.{}", task_id, TASK_EXTENSION))
    }

    pub fn lock_file(&self) -> PathBuf {
        self.pending_dir.join(LOCK_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_file_names() {
        assert_eq!(task_id_from_file_name("t1.json"), Some("t1"));
        assert_eq!(task_id_from_file_name("job-2.v1.json"), Some("job-2.v1"));
        assert_eq!(task_id_from_file_name(".t1.json.tmp"), None);
        assert_eq!(task_id_from_file_name("t1.json.invalid"), None);
        assert_eq!(task_id_from_file_name(".inprogress-t1"), None);
        assert_eq!(task_id_from_file_name("t1.txt"), None);
        assert_eq!(task_id_from_file_name(".json"), None);
    }

    #[test]
    fn marker_names() {
        assert_eq!(task_id_from_marker_name(".inprogress-t1"), Some("t1"));
        assert_eq!(task_id_from_marker_name(".inprogress-"), None);
        assert_eq!(task_id_from_marker_name("t1.json"), None);
    }

    #[test]
    fn identifiers_reject_traversal() {
        assert!(is_valid_identifier("anga"));
        assert!(!is_valid_identifier("../etc"));
        assert!(!is_valid_identifier("a/b"));
        assert!(!is_valid_identifier(".hidden"));
        assert!(!is_valid_identifier(""));
    }

    #[test]
    fn worker_paths_follow_layout() {
        let layout = Layout::under(Path::new("/srv/relay"));
        let paths = layout.worker("anga");
        assert_eq!(
            paths.task_file("t1"),
            PathBuf::from("/srv/relay/tasks/anga/t1.json")
        );
        assert_eq!(
            paths.claim_marker("t1"),
            PathBuf::from("/srv/relay/tasks/anga/.inprogress-t1")
        );
        assert_eq!(
            paths.result_file("t1"),
            PathBuf::from("/srv/relay/results/anga/t1.json")
        );
        assert_eq!(
            paths.heartbeat_file,
            PathBuf::from("/srv/relay/heartbeats/anga.json")
        );
        assert_eq!(
            paths.control_pipe,
            PathBuf::from("/srv/relay/pipes/anga-control")
        );
        assert_eq!(
            quarantine_path(&paths.task_file("t1")),
            PathBuf::from("/srv/relay/tasks/anga/t1.json.invalid")
        );
    }
}
