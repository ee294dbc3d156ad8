use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::stat::Mode;
use relay_common::{RelayError, RelayResult, WorkerPaths};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LISTEN_QUEUE: usize = 64;
const OPEN_RETRY: Duration = Duration::from_millis(10);
const UNBLOCK_ATTEMPTS: u32 = 100;

/// Creates the FIFO unless it already exists. A regular file in its place is
/// an error rather than something to delete.
pub fn ensure_fifo(path: &Path) -> RelayResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| RelayError::io(parent, err))?;
    }

    match fs::metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => return Ok(()),
        Ok(_) => {
            return Err(RelayError::io(
                path,
                io::Error::new(io::ErrorKind::AlreadyExists, "exists and is not a FIFO"),
            ))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(RelayError::io(path, err)),
    }

    match nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(errno) => Err(RelayError::io(path, io::Error::from(errno))),
    }
}

fn no_receiver(path: &Path) -> RelayError {
    RelayError::NoReceiver {
        path: path.to_path_buf(),
    }
}

/// Maps the errors that mean "nobody is reading" to `NoReceiver`.
fn map_send_error(path: &Path, err: io::Error) -> RelayError {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::BrokenPipe => no_receiver(path),
        _ if err.raw_os_error() == Some(libc::ENXIO) => no_receiver(path),
        _ => RelayError::io(path, err),
    }
}

fn frame(message: &str) -> Vec<u8> {
    let mut bytes = message.as_bytes().to_vec();
    if !bytes.ends_with(b"\n") {
        bytes.push(b'\n');
    }
    bytes
}

fn write_message(path: &Path, mut file: File, message: &str) -> RelayResult<()> {
    file.write_all(&frame(message))
        .and_then(|()| file.flush())
        .map_err(|err| map_send_error(path, err))
}

/// Opens the FIFO for writing without waiting for a reader. `ENXIO` means
/// there is none.
fn open_writer_nonblocking(path: &Path) -> io::Result<File> {
    let file = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;

    let fd = file.as_raw_fd();
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.remove(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(file)
}

/// Writes one message, blocking until a reader opens the pipe.
pub fn send_blocking(path: &Path, message: &str) -> RelayResult<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|err| map_send_error(path, err))?;
    write_message(path, file, message)
}

/// Async form of [`send_blocking`]; waits as long as it takes.
pub async fn send(path: &Path, message: &str) -> RelayResult<()> {
    let owned = path.to_path_buf();
    let message = message.to_string();
    tokio::task::spawn_blocking(move || send_blocking(&owned, &message))
        .await
        .map_err(|err| RelayError::io(path, io::Error::new(io::ErrorKind::Other, err)))?
}

/// Sends if a reader attaches within `timeout`, otherwise `NoReceiver`. A
/// zero timeout makes exactly one attempt.
pub async fn send_timeout(path: &Path, message: &str, timeout: Duration) -> RelayResult<()> {
    let deadline = Instant::now() + timeout;
    let file = loop {
        match open_writer_nonblocking(path) {
            Ok(file) => break file,
            Err(err) if err.raw_os_error() == Some(libc::ENXIO) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(no_receiver(path));
                }
                tokio::time::sleep(OPEN_RETRY.min(deadline - now)).await;
            }
            Err(err) => return Err(map_send_error(path, err)),
        }
    };

    let owned = path.to_path_buf();
    let message = message.to_string();
    tokio::task::spawn_blocking(move || write_message(&owned, file, &message))
        .await
        .map_err(|err| RelayError::io(path, io::Error::new(io::ErrorKind::Other, err)))?
}

/// The worker's end of its control/status pipes.
#[derive(Debug, Clone)]
pub struct PipeChannel {
    pub worker: String,
    pub control_path: PathBuf,
    pub status_path: PathBuf,
    pub open_since: DateTime<Utc>,
}

impl PipeChannel {
    pub fn create(paths: &WorkerPaths) -> RelayResult<Self> {
        ensure_fifo(&paths.control_pipe)?;
        ensure_fifo(&paths.status_pipe)?;
        Ok(Self {
            worker: paths.worker.clone(),
            control_path: paths.control_pipe.clone(),
            status_path: paths.status_pipe.clone(),
            open_since: Utc::now(),
        })
    }

    /// Reads the control pipe in a loop on a dedicated thread. Each
    /// open-read-to-EOF cycle yields its non-empty lines. Cancelling the
    /// token unblocks the pending open and ends the stream.
    pub fn listen(&self, cancel: CancellationToken) -> RelayResult<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(LISTEN_QUEUE);
        let path = self.control_path.clone();
        let done = Arc::new(AtomicBool::new(false));

        {
            let path = path.clone();
            let cancel = cancel.clone();
            let done = done.clone();
            let worker = self.worker.clone();
            thread::Builder::new()
                .name(format!("relay-pipe-{}", self.worker))
                .spawn(move || {
                    read_loop(&worker, &path, &tx, &cancel);
                    done.store(true, Ordering::SeqCst);
                })
                .map_err(|err| RelayError::io(&self.control_path, err))?;
        }

        tokio::spawn(async move {
            cancel.cancelled().await;
            for _ in 0..UNBLOCK_ATTEMPTS {
                if done.load(Ordering::SeqCst) {
                    return;
                }
                // A writer that connects and closes hands the reader an EOF.
                let _ = open_writer_nonblocking(&path);
                tokio::time::sleep(OPEN_RETRY).await;
            }
            warn!(path = %path.display(), "control pipe reader did not stop");
        });

        info!(worker = %self.worker, path = %self.control_path.display(), "listening on control pipe");
        Ok(rx)
    }

    /// Best-effort reply on the status pipe; dropped when nobody reads it.
    pub async fn reply(&self, message: &str) -> RelayResult<()> {
        send_timeout(&self.status_path, message, Duration::ZERO).await
    }
}

fn read_loop(
    worker: &str,
    path: &Path,
    tx: &mpsc::Sender<String>,
    cancel: &CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }

        // Blocks until a writer shows up.
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) => {
                warn!(worker, path = %path.display(), error = %err, "control pipe open failed");
                thread::sleep(Duration::from_millis(250));
                continue;
            }
        };
        if cancel.is_cancelled() {
            return;
        }

        let mut text = String::new();
        if let Err(err) = file.read_to_string(&mut text) {
            warn!(worker, error = %err, "control pipe read failed");
            continue;
        }
        drop(file);

        for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
            debug!(worker, message = line, "control message received");
            if tx.blocking_send(line.to_string()).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_common::Layout;
    use tempfile::TempDir;

    fn channel(dir: &TempDir) -> PipeChannel {
        PipeChannel::create(&Layout::under(dir.path()).worker("anga")).unwrap()
    }

    #[tokio::test]
    async fn zero_timeout_without_reader_is_no_receiver() {
        let dir = TempDir::new().unwrap();
        let pipes = channel(&dir);

        let err = send_timeout(&pipes.control_path, "ping", Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E_NO_RECEIVER");
    }

    #[tokio::test]
    async fn missing_pipe_is_no_receiver() {
        let dir = TempDir::new().unwrap();
        let err = send_timeout(&dir.path().join("nope"), "ping", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E_NO_RECEIVER");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn listener_yields_lines_per_write() {
        let dir = TempDir::new().unwrap();
        let pipes = channel(&dir);
        let cancel = CancellationToken::new();
        let mut rx = pipes.listen(cancel.clone()).unwrap();

        send_timeout(&pipes.control_path, "wake\nhello there", Duration::from_secs(2))
            .await
            .unwrap();
        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some("wake"));
        assert_eq!(second.as_deref(), Some("hello there"));

        cancel.cancel();
        let closed = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.unwrap();
        assert!(closed.is_none());
    }

    #[test]
    fn regular_file_is_not_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("anga-control");
        fs::write(&path, b"x").unwrap();
        assert!(ensure_fifo(&path).is_err());
        assert_eq!(fs::read(&path).unwrap(), b"x");
    }
}
