use std::path::Path;

use relay_common::{RelayError, RelayResult};

use super::Subscription;

/// Native filesystem notifications (inotify, kqueue, FSEvents, ...).
#[derive(Debug, Clone, Default)]
pub struct EventWatchBackend {
    unavailable: Option<String>,
}

impl EventWatchBackend {
    #[cfg(feature = "event-watch")]
    pub fn new() -> Self {
        Self { unavailable: None }
    }

    #[cfg(not(feature = "event-watch"))]
    pub fn new() -> Self {
        Self::disabled("built without the event-watch feature")
    }

    /// A backend whose every subscription fails with `BackendUnavailable`.
    pub fn disabled(reason: impl Into<String>) -> Self {
        Self {
            unavailable: Some(reason.into()),
        }
    }

    pub fn subscribe(&self, dir: &Path) -> RelayResult<Subscription> {
        if let Some(reason) = &self.unavailable {
            return Err(RelayError::BackendUnavailable {
                reason: reason.clone(),
            });
        }
        imp::subscribe(dir)
    }
}

#[cfg(feature = "event-watch")]
mod imp {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use notify::event::{ModifyKind, RenameMode};
    use notify::{Event, EventKind, RecursiveMode, Watcher};
    use relay_common::{RelayError, RelayResult, TriggerSource};
    use tokio::sync::mpsc;
    use tracing::{debug, warn};

    use crate::signal::{EventSender, PathEvent, PathOp, Subscription, SubscriptionGuard};

    pub(super) fn subscribe(dir: &Path) -> RelayResult<Subscription> {
        // Watches need an existing inode.
        fs::create_dir_all(dir).map_err(|err| RelayError::io(dir, err))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let sender = Mutex::new(Some(tx));
        let root = dir.to_path_buf();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let Ok(mut slot) = sender.lock() else {
                return;
            };
            let keep_open = match res {
                Ok(event) => forward(&root, &event, slot.as_ref()),
                Err(err) => {
                    warn!(dir = %root.display(), error = %err, "event watch failed");
                    false
                }
            };
            if !keep_open {
                // Closing the stream makes the watcher subscribe again.
                slot.take();
            }
        })
        .map_err(|err| RelayError::BackendUnavailable {
            reason: err.to_string(),
        })?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|err| RelayError::BackendUnavailable {
                reason: format!("cannot watch {}: {}", dir.display(), err),
            })?;

        debug!(dir = %dir.display(), "event-watch subscription established");
        Ok(Subscription::new(
            rx,
            TriggerSource::EventWatch,
            SubscriptionGuard::Event(watcher),
        ))
    }

    /// Returns false when the subscription should be torn down.
    fn forward(root: &Path, event: &Event, sender: Option<&EventSender>) -> bool {
        let Some(sender) = sender else {
            return false;
        };

        if matches!(event.kind, EventKind::Remove(_)) && event.paths.iter().any(|p| p == root) {
            warn!(dir = %root.display(), "watched directory removed");
            return false;
        }

        if event.need_rescan() {
            // Events were dropped; a fresh subscription triggers a full listing.
            warn!(dir = %root.display(), "event watch lost events, rescanning");
            return false;
        }

        for (path, op) in arrivals(event) {
            if sender.send(PathEvent { path, op }).is_err() {
                return false;
            }
        }
        true
    }

    fn arrivals(event: &Event) -> Vec<(PathBuf, PathOp)> {
        match &event.kind {
            EventKind::Create(_) => event
                .paths
                .iter()
                .map(|path| (path.clone(), PathOp::Created))
                .collect(),
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
                .paths
                .iter()
                .map(|path| (path.clone(), PathOp::MovedIn))
                .collect(),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => event
                .paths
                .get(1)
                .map(|path| vec![(path.clone(), PathOp::MovedIn)])
                .unwrap_or_default(),
            // Some platforms cannot tell the two ends of a rename apart.
            EventKind::Modify(ModifyKind::Name(_)) => event
                .paths
                .iter()
                .filter(|path| path.exists())
                .map(|path| (path.clone(), PathOp::MovedIn))
                .collect(),
            _ => Vec::new(),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use notify::event::{CreateKind, Flag};

        #[test]
        fn rename_both_reports_destination() {
            let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
                .add_path(PathBuf::from("/q/.t1.json.tmp"))
                .add_path(PathBuf::from("/q/t1.json"));
            assert_eq!(
                arrivals(&event),
                vec![(PathBuf::from("/q/t1.json"), PathOp::MovedIn)]
            );
        }

        #[test]
        fn removal_of_root_closes_stream() {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let root = PathBuf::from("/q");
            let removed = Event::new(EventKind::Remove(notify::event::RemoveKind::Folder))
                .add_path(root.clone());
            assert!(!forward(&root, &removed, Some(&tx)));

            let created = Event::new(EventKind::Create(CreateKind::File))
                .add_path(PathBuf::from("/q/t1.json"));
            assert!(forward(&root, &created, Some(&tx)));
            assert_eq!(rx.try_recv().unwrap().path, PathBuf::from("/q/t1.json"));
            assert!(rx.try_recv().is_err());
            assert!(!forward(&root, &created, None));
        }

        #[test]
        fn rescan_notice_closes_stream() {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let root = PathBuf::from("/q");
            let rescan = Event::new(EventKind::Other).set_flag(Flag::Rescan);
            assert!(!forward(&root, &rescan, Some(&tx)));
            assert!(rx.try_recv().is_err());
        }
    }
}

#[cfg(not(feature = "event-watch"))]
mod imp {
    use std::path::Path;

    use relay_common::{RelayError, RelayResult};

    use crate::signal::Subscription;

    pub(super) fn subscribe(_dir: &Path) -> RelayResult<Subscription> {
        Err(RelayError::BackendUnavailable {
            reason: "built without the event-watch feature".into(),
        })
    }
}
