//! How a worker learns that a file appeared in its task directory.
//!
//! Both variants hand back the same [`Subscription`]: an unbounded stream of
//! [`PathEvent`]s that closes when the underlying mechanism gives up. The
//! Trigger Watcher treats a closed stream as a signal to subscribe again.

mod event;
mod poll;

use std::path::{Path, PathBuf};
use std::time::Duration;

use relay_common::{RelayError, RelayResult, SignalBackendKind, TriggerSource};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::DropGuard;
use tracing::warn;

pub use event::EventWatchBackend;
pub use poll::PollBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathOp {
    Created,
    MovedIn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEvent {
    pub path: PathBuf,
    pub op: PathOp,
}

pub(crate) type EventSender = UnboundedSender<PathEvent>;

/// Keeps the producing side of a subscription alive.
pub(crate) enum SubscriptionGuard {
    Poll(DropGuard),
    #[cfg(feature = "event-watch")]
    Event(notify::RecommendedWatcher),
}

pub struct Subscription {
    events: UnboundedReceiver<PathEvent>,
    source: TriggerSource,
    _guard: SubscriptionGuard,
}

impl Subscription {
    pub(crate) fn new(
        events: UnboundedReceiver<PathEvent>,
        source: TriggerSource,
        guard: SubscriptionGuard,
    ) -> Self {
        Self {
            events,
            source,
            _guard: guard,
        }
    }

    /// Next event, or `None` once the backend closed the stream.
    pub async fn recv(&mut self) -> Option<PathEvent> {
        self.events.recv().await
    }

    pub fn source(&self) -> TriggerSource {
        self.source
    }
}

/// Tagged variant over the two discovery mechanisms.
pub enum SignalBackend {
    EventWatch(EventWatchBackend),
    Poll(PollBackend),
}

impl SignalBackend {
    pub fn source(&self) -> TriggerSource {
        match self {
            SignalBackend::EventWatch(_) => TriggerSource::EventWatch,
            SignalBackend::Poll(_) => TriggerSource::Poll,
        }
    }

    pub fn subscribe(&self, dir: &Path) -> RelayResult<Subscription> {
        match self {
            SignalBackend::EventWatch(backend) => backend.subscribe(dir),
            SignalBackend::Poll(backend) => backend.subscribe(dir),
        }
    }
}

/// Applies the selection policy: event-watch first when allowed, poll after
/// the first failure. The downgrade is sticky and logged once.
pub struct BackendSelector {
    kind: SignalBackendKind,
    preferred: SignalBackend,
    fallback: SignalBackend,
    downgraded: bool,
}

impl BackendSelector {
    pub fn new(kind: SignalBackendKind, poll_interval: Duration) -> Self {
        Self::with_event_backend(kind, EventWatchBackend::new(), poll_interval)
    }

    /// Lets callers substitute the event-watch variant, e.g. a disabled one.
    pub fn with_event_backend(
        kind: SignalBackendKind,
        event: EventWatchBackend,
        poll_interval: Duration,
    ) -> Self {
        let preferred = match kind {
            SignalBackendKind::Poll => SignalBackend::Poll(PollBackend::new(poll_interval)),
            SignalBackendKind::Auto | SignalBackendKind::Event => SignalBackend::EventWatch(event),
        };
        Self {
            kind,
            preferred,
            fallback: SignalBackend::Poll(PollBackend::new(poll_interval)),
            downgraded: false,
        }
    }

    pub fn kind(&self) -> SignalBackendKind {
        self.kind
    }

    pub fn is_downgraded(&self) -> bool {
        self.downgraded
    }

    /// The variant the next subscription will use.
    pub fn active(&self) -> &SignalBackend {
        if self.downgraded {
            &self.fallback
        } else {
            &self.preferred
        }
    }

    pub fn subscribe(&mut self, dir: &Path) -> RelayResult<Subscription> {
        if self.downgraded {
            return self.fallback.subscribe(dir);
        }
        match self.preferred.subscribe(dir) {
            Err(RelayError::BackendUnavailable { reason }) if self.kind == SignalBackendKind::Auto => {
                warn!(
                    dir = %dir.display(),
                    reason = %reason,
                    "event-watch backend unavailable, falling back to polling"
                );
                self.downgraded = true;
                self.fallback.subscribe(dir)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn auto_downgrades_once_and_stays_on_poll() {
        let dir = TempDir::new().unwrap();
        let mut selector = BackendSelector::with_event_backend(
            SignalBackendKind::Auto,
            EventWatchBackend::disabled("forced"),
            Duration::from_millis(50),
        );

        let first = selector.subscribe(dir.path()).unwrap();
        assert_eq!(first.source(), TriggerSource::Poll);
        assert!(selector.is_downgraded());
        assert_eq!(selector.active().source(), TriggerSource::Poll);

        let second = selector.subscribe(dir.path()).unwrap();
        assert_eq!(second.source(), TriggerSource::Poll);
    }

    #[tokio::test]
    async fn forced_event_surfaces_unavailable() {
        let dir = TempDir::new().unwrap();
        let mut selector = BackendSelector::with_event_backend(
            SignalBackendKind::Event,
            EventWatchBackend::disabled("forced"),
            Duration::from_millis(50),
        );

        let err = selector.subscribe(dir.path()).err().unwrap();
        assert_eq!(err.code(), "E_BACKEND_UNAVAILABLE");
        assert!(!selector.is_downgraded());
    }
}
