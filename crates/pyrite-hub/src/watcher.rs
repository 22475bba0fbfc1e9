use crate::config::{RepositorySpec, WatchSettings};
use crate::debounce::Debouncer;
use crate::scanner::{relative_path, IncludeSet};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use pyrite_core::{next_backoff, Diagnostic, DiagnosticKind, INITIAL_BACKOFF};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep, sleep_until, Instant},
};
use tracing::{debug, info, warn};

const EVENT_QUEUE: usize = 1024;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to watch {path}: {source}")]
    Establish {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

pub type Trigger = Arc<dyn Fn() + Send + Sync>;
pub type Reporter = Arc<dyn Fn(Diagnostic) + Send + Sync>;

/// Stops the watch task when dropped.
pub struct WatchHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}

enum PumpExit {
    Stop,
    Rescope,
    Lost(String),
}

pub struct RepositoryWatcher {
    spec: RepositorySpec,
    include: Arc<IncludeSet>,
    settings: WatchSettings,
    trigger: Trigger,
    report: Reporter,
}

impl RepositoryWatcher {
    pub fn new(
        spec: RepositorySpec,
        include: Arc<IncludeSet>,
        settings: WatchSettings,
        trigger: Trigger,
        report: Reporter,
    ) -> Self {
        Self {
            spec,
            include,
            settings,
            trigger,
            report,
        }
    }

    pub fn spawn(self) -> WatchHandle {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(self.run(rx));
        WatchHandle { shutdown, task }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = INITIAL_BACKOFF;
        let mut recovering = false;
        loop {
            let target = self.spec.scan_root();
            let (tx, rx) = mpsc::channel(EVENT_QUEUE);
            match establish(&target, tx) {
                Ok(watcher) => {
                    info!(event = "watch_started", repository = %self.spec.name, path = %target.display());
                    backoff = INITIAL_BACKOFF;
                    if recovering {
                        (self.trigger)();
                        recovering = false;
                    }
                    let watching_fallback = target != self.spec.work_root();
                    let exit = self.pump(&target, rx, watching_fallback, &mut shutdown).await;
                    drop(watcher);
                    match exit {
                        PumpExit::Stop => {
                            debug!(event = "watch_stopped", repository = %self.spec.name);
                            return;
                        }
                        PumpExit::Rescope => {
                            (self.trigger)();
                            continue;
                        }
                        PumpExit::Lost(reason) => {
                            self.lost(&target, reason);
                            (self.trigger)();
                            recovering = true;
                        }
                    }
                }
                Err(err) => {
                    self.lost(&target, err.to_string());
                    recovering = true;
                }
            }

            tokio::select! {
                _ = shutdown.changed() => return,
                _ = sleep(backoff) => {}
            }
            backoff = next_backoff(backoff);
        }
    }

    async fn pump(
        &self,
        target: &Path,
        mut rx: mpsc::Receiver<notify::Result<Event>>,
        watching_fallback: bool,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PumpExit {
        let mut debouncer = Debouncer::new(self.settings.debounce, self.settings.max_wait);
        loop {
            let deadline = debouncer
                .deadline()
                .map(Instant::from_std)
                .unwrap_or_else(|| Instant::now() + self.settings.max_wait);
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return PumpExit::Stop;
                    }
                }
                received = rx.recv() => match received {
                    Some(Ok(event)) => {
                        if self.is_relevant(&event) {
                            debouncer.record(std::time::Instant::now());
                        }
                        if watching_fallback && self.spec.work_root().is_dir() {
                            return PumpExit::Rescope;
                        }
                        if !target.is_dir() {
                            return PumpExit::Lost(format!("{} disappeared", target.display()));
                        }
                    }
                    Some(Err(err)) => return PumpExit::Lost(err.to_string()),
                    None => return PumpExit::Lost("watch channel closed".to_string()),
                },
                _ = sleep_until(deadline), if debouncer.is_pending() => {
                    if debouncer.poll(std::time::Instant::now()) {
                        debug!(event = "watch_fire", repository = %self.spec.name);
                        (self.trigger)();
                    }
                }
            }
        }
    }

    fn lost(&self, target: &Path, reason: String) {
        warn!(event = "watch_lost", repository = %self.spec.name, path = %target.display(), error = %reason);
        (self.report)(Diagnostic::new(
            &self.spec.name,
            DiagnosticKind::Watch,
            relative_path(&self.spec.root, target),
            reason,
        ));
    }

    fn is_relevant(&self, event: &Event) -> bool {
        if matches!(event.kind, EventKind::Access(_)) {
            return false;
        }
        event
            .paths
            .iter()
            .any(|path| is_relevant_path(&self.spec.root, &self.include, path))
    }
}

/// Matches included files, plus anything that may be a directory so that
/// folder moves and deletions are noticed.
pub fn is_relevant_path(root: &Path, include: &IncludeSet, path: &Path) -> bool {
    let Some(relative) = relative_path(root, path) else {
        return false;
    };
    if relative.split('/').any(|part| part.starts_with('.')) {
        return false;
    }
    include.is_match(&relative) || path.extension().is_none()
}

fn establish(
    target: &Path,
    tx: mpsc::Sender<notify::Result<Event>>,
) -> Result<RecommendedWatcher, WatchError> {
    let wrap = |source| WatchError::Establish {
        path: target.to_path_buf(),
        source,
    };
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = tx.blocking_send(res);
    })
    .map_err(wrap)?;
    watcher
        .watch(target, RecursiveMode::Recursive)
        .map_err(wrap)?;
    Ok(watcher)
}
