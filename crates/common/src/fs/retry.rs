use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::{RelayError, RelayResult};

const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY: Duration = Duration::from_millis(25);

/// Races with other processes touching the same file surface as these.
/// Anything else (including `NotFound`) is a real answer, not noise.
pub fn is_transient(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::PermissionDenied
    ) {
        return true;
    }

    #[cfg(unix)]
    {
        matches!(err.raw_os_error(), Some(libc::EBUSY) | Some(libc::ETXTBSY))
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Runs `op`, retrying transient failures with jittered exponential backoff.
///
/// The backoff sleeps on the calling thread. With three attempts it totals at
/// most 125ms, which async callers on the runtime tolerate.
pub fn retry_transient<T>(path: &Path, mut op: impl FnMut() -> io::Result<T>) -> RelayResult<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => {
                attempt += 1;
                if attempt >= MAX_ATTEMPTS {
                    return Err(RelayError::TransientIo {
                        path: path.to_path_buf(),
                        source: err,
                    });
                }
                let backoff = BASE_DELAY * 2u32.pow(attempt - 1);
                let jitter = rand::thread_rng().gen_range(0..=BASE_DELAY.as_millis() as u64);
                debug!(
                    path = %path.display(),
                    attempt,
                    error = %err,
                    "transient IO failure, retrying"
                );
                thread::sleep(backoff + Duration::from_millis(jitter));
            }
            Err(err) => return Err(RelayError::io(path, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_until_success() {
        let mut calls = 0;
        let value = retry_transient(Path::new("x"), || {
            calls += 1;
            if calls < 2 {
                Err(io::Error::new(io::ErrorKind::Interrupted, "again"))
            } else {
                Ok(7)
            }
        })
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls, 2);
    }

    #[test]
    fn gives_up_after_budget() {
        let started = std::time::Instant::now();
        let mut calls = 0;
        let err = retry_transient::<()>(Path::new("x"), || {
            calls += 1;
            Err(io::Error::new(io::ErrorKind::WouldBlock, "busy"))
        })
        .unwrap_err();
        assert_eq!(calls, MAX_ATTEMPTS);
        assert_eq!(err.code(), "E_TRANSIENT_IO");
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn not_found_is_not_retried() {
        let mut calls = 0;
        let err = retry_transient::<()>(Path::new("x"), || {
            calls += 1;
            Err(io::Error::new(io::ErrorKind::NotFound, "gone"))
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert_eq!(err.code(), "E_IO");
    }
}
