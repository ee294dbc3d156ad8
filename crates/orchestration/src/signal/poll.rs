use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use relay_common::{RelayError, RelayResult, TriggerSource};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{EventSender, PathEvent, PathOp, Subscription, SubscriptionGuard};

/// Lists the directory every `interval` and reports names that were not
/// present on the previous listing.
#[derive(Debug, Clone)]
pub struct PollBackend {
    interval: Duration,
}

impl PollBackend {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Files already present when the subscription starts are not reported;
    /// reconciliation covers them.
    pub fn subscribe(&self, dir: &Path) -> RelayResult<Subscription> {
        let baseline = list_names(dir).map_err(|err| RelayError::io(dir, err))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(poll_loop(
            dir.to_path_buf(),
            self.interval,
            baseline,
            tx,
            cancel.clone(),
        ));

        debug!(dir = %dir.display(), interval_ms = self.interval.as_millis() as u64, "poll subscription established");
        Ok(Subscription::new(
            rx,
            TriggerSource::Poll,
            SubscriptionGuard::Poll(cancel.drop_guard()),
        ))
    }
}

async fn poll_loop(
    dir: PathBuf,
    interval: Duration,
    mut seen: BTreeSet<OsString>,
    tx: EventSender,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tx.closed() => return,
            _ = ticker.tick() => {}
        }

        let current = match list_names(&dir) {
            Ok(names) => names,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "directory listing failed");
                continue;
            }
        };

        for name in current.difference(&seen) {
            let event = PathEvent {
                path: dir.join(name),
                op: PathOp::Created,
            };
            if tx.send(event).is_err() {
                return;
            }
        }
        // Names that vanish and come back (re-queued tasks) are reported again.
        seen = current;
    }
}

/// A missing directory is an empty set, not an error.
fn list_names(dir: &Path) -> io::Result<BTreeSet<OsString>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(err) => return Err(err),
    };

    let mut names = BTreeSet::new();
    for entry in entries {
        let entry = entry?;
        names.insert(entry.file_name());
    }
    Ok(names)
}
