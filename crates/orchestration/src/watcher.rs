use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relay_common::layout::task_id_from_file_name;
use relay_common::{RelayError, RelayResult, Trigger, TriggerSource};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::signal::{BackendSelector, PathEvent, Subscription};

/// How long a trigger may wait for room in the intake queue before the
/// watcher gives up on it and asks for a reconciliation pass instead.
pub const DEFAULT_INTAKE_WAIT: Duration = Duration::from_millis(100);

const RESUBSCRIBE_BASE: Duration = Duration::from_millis(250);
const RESUBSCRIBE_MAX: Duration = Duration::from_secs(5);

/// Turns signal-backend events for one worker directory into Triggers.
pub struct TriggerWatcher {
    worker: String,
    dir: PathBuf,
    selector: BackendSelector,
    intake: mpsc::Sender<Trigger>,
    reconcile: Arc<Notify>,
    intake_wait: Duration,
    subscription: Option<Subscription>,
}

impl TriggerWatcher {
    pub fn new(
        worker: impl Into<String>,
        dir: impl Into<PathBuf>,
        selector: BackendSelector,
        intake: mpsc::Sender<Trigger>,
        reconcile: Arc<Notify>,
    ) -> Self {
        Self {
            worker: worker.into(),
            dir: dir.into(),
            selector,
            intake,
            reconcile,
            intake_wait: DEFAULT_INTAKE_WAIT,
            subscription: None,
        }
    }

    pub fn with_intake_wait(mut self, wait: Duration) -> Self {
        self.intake_wait = wait;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Establishes the first subscription. Fails only when the configured
    /// backend cannot start at all (forced event-watch).
    pub fn connect(&mut self) -> RelayResult<TriggerSource> {
        let subscription = self.selector.subscribe(&self.dir)?;
        let source = subscription.source();
        info!(
            worker = %self.worker,
            dir = %self.dir.display(),
            source = %source,
            "trigger watcher subscribed"
        );
        self.subscription = Some(subscription);
        Ok(source)
    }

    pub async fn run(mut self, cancel: CancellationToken) -> RelayResult<()> {
        let mut backoff = RESUBSCRIBE_BASE;

        loop {
            let mut subscription = match self.subscription.take() {
                Some(subscription) => subscription,
                None => match self.selector.subscribe(&self.dir) {
                    Ok(subscription) => {
                        info!(
                            worker = %self.worker,
                            source = %subscription.source(),
                            "trigger watcher re-subscribed"
                        );
                        // Events may have been missed while unsubscribed.
                        self.reconcile.notify_one();
                        backoff = RESUBSCRIBE_BASE;
                        subscription
                    }
                    Err(err @ RelayError::BackendUnavailable { .. }) => return Err(err),
                    Err(err) => {
                        warn!(worker = %self.worker, error = %err, "re-subscribe failed");
                        if !sleep_or_cancel(&cancel, backoff).await {
                            return Ok(());
                        }
                        backoff = (backoff * 2).min(RESUBSCRIBE_MAX);
                        continue;
                    }
                },
            };
            let source = subscription.source();

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    event = subscription.recv() => event,
                };

                let Some(event) = event else {
                    warn!(
                        worker = %self.worker,
                        source = %source,
                        "signal stream closed, re-subscribing"
                    );
                    break;
                };

                if !self.forward(event, source).await {
                    debug!(worker = %self.worker, "intake closed, watcher exiting");
                    return Ok(());
                }
            }

            drop(subscription);
            if !sleep_or_cancel(&cancel, backoff).await {
                return Ok(());
            }
            backoff = (backoff * 2).min(RESUBSCRIBE_MAX);
        }
    }

    /// Returns false once the dispatcher side of the intake is gone.
    async fn forward(&mut self, event: PathEvent, source: TriggerSource) -> bool {
        let Some(trigger) = self.trigger_for(&event, source) else {
            return true;
        };
        let task_id = trigger.task_id.clone();

        match self.intake.send_timeout(trigger, self.intake_wait).await {
            Ok(()) => {
                debug!(worker = %self.worker, task_id = %task_id, source = %source, "trigger queued");
                true
            }
            Err(SendTimeoutError::Timeout(_)) => {
                // The directory listing will find it.
                debug!(worker = %self.worker, task_id = %task_id, "intake full, requesting reconciliation");
                self.reconcile.notify_one();
                true
            }
            Err(SendTimeoutError::Closed(_)) => false,
        }
    }

    fn trigger_for(&self, event: &PathEvent, source: TriggerSource) -> Option<Trigger> {
        let name = event.path.file_name()?.to_str()?;
        let task_id = task_id_from_file_name(name)?;
        Some(Trigger {
            worker_id: self.worker.clone(),
            task_id: task_id.to_string(),
            observed_at: Utc::now(),
            source,
        })
    }
}

async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
