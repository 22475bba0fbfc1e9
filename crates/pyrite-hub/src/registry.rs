use crate::broadcast::Hub;
use crate::cache::{CycleGate, StateCache};
use crate::config::{RepositorySpec, WatchSettings};
use crate::scanner::{scan_repository, IncludeSet, ScanError};
use crate::watcher::{RepositoryWatcher, WatchHandle};
use chrono::Utc;
use pyrite_core::protocol::{SnapshotPayload, UnwatchedPayload, UpdatePayload, WireMsg};
use pyrite_core::{diff, reconcile, Diagnostic, DiagnosticKind, RepositorySnapshot, RepositoryStats};
use serde::Serialize;
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("repository '{0}' is already watched")]
    AlreadyWatched(String),
    #[error("repository '{0}' is not watched")]
    NotWatched(String),
    #[error("invalid repository name '{0}'")]
    InvalidName(String),
    #[error(transparent)]
    Scan(#[from] ScanError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle held the gate; this trigger was folded into it.
    Coalesced,
    Failed,
    /// The repository was unwatched while this cycle was scanning; its
    /// result was thrown away.
    Retired,
    Unchanged { revision: u64 },
    Changed { revision: u64, changes: usize },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryInfo {
    pub name: String,
    pub root: PathBuf,
    pub revision: u64,
    pub stats: RepositoryStats,
}

struct RepositoryEntry {
    spec: RepositorySpec,
    include: Arc<IncludeSet>,
    gate: CycleGate,
    watcher: AsyncMutex<Option<WatchHandle>>,
    retired: AtomicBool,
    // Held while a cycle publishes and while unwatch tears down, so a late
    // cycle can never re-insert or announce an unwatched repository.
    commit: AsyncMutex<()>,
}

/// Owns every watched repository and runs their re-parse cycles.
pub struct Registry {
    cache: Arc<StateCache>,
    hub: Arc<Hub>,
    settings: WatchSettings,
    entries: RwLock<HashMap<String, Arc<RepositoryEntry>>>,
}

impl Registry {
    pub fn new(hub: Arc<Hub>, settings: WatchSettings) -> Arc<Self> {
        Arc::new(Self {
            cache: hub.cache().clone(),
            hub,
            settings,
            entries: RwLock::new(HashMap::new()),
        })
    }

    pub fn cache(&self) -> &Arc<StateCache> {
        &self.cache
    }

    /// Registers the repository, runs its initial cycle and starts its
    /// filesystem watcher.
    pub async fn watch(self: &Arc<Self>, spec: RepositorySpec) -> Result<CycleOutcome, RegistryError> {
        let entry = self.insert(spec).await?;
        let outcome = self.trigger(&entry.spec.name).await;

        let name = entry.spec.name.clone();
        let weak: Weak<Registry> = Arc::downgrade(self);
        let trigger_name = name.clone();
        let trigger = Arc::new(move || {
            let Some(registry) = weak.upgrade() else {
                return;
            };
            let name = trigger_name.clone();
            tokio::spawn(async move {
                registry.trigger(&name).await;
            });
        });
        let weak: Weak<Registry> = Arc::downgrade(self);
        let report = Arc::new(move |diagnostic: Diagnostic| {
            let Some(registry) = weak.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                registry.report(diagnostic).await;
            });
        });
        let handle = RepositoryWatcher::new(
            entry.spec.clone(),
            entry.include.clone(),
            self.settings,
            trigger,
            report,
        )
        .spawn();
        *entry.watcher.lock().await = Some(handle);
        info!(event = "repository_watched", repository = %name, root = %entry.spec.root.display());
        Ok(outcome)
    }

    /// Registers the repository and runs its initial cycle without a
    /// filesystem watcher; later cycles run only through [`Registry::trigger`].
    pub async fn track(&self, spec: RepositorySpec) -> Result<CycleOutcome, RegistryError> {
        let entry = self.insert(spec).await?;
        Ok(self.trigger(&entry.spec.name).await)
    }

    async fn insert(&self, spec: RepositorySpec) -> Result<Arc<RepositoryEntry>, RegistryError> {
        if spec.name.trim().is_empty() || spec.name.contains('/') {
            return Err(RegistryError::InvalidName(spec.name));
        }
        let include = Arc::new(IncludeSet::new(&spec.include)?);
        let mut entries = self.entries.write().await;
        if entries.contains_key(&spec.name) {
            return Err(RegistryError::AlreadyWatched(spec.name));
        }
        let entry = Arc::new(RepositoryEntry {
            spec,
            include,
            gate: CycleGate::default(),
            watcher: AsyncMutex::new(None),
            retired: AtomicBool::new(false),
            commit: AsyncMutex::new(()),
        });
        entries.insert(entry.spec.name.clone(), entry.clone());
        Ok(entry)
    }

    pub async fn unwatch(&self, name: &str) -> Result<(), RegistryError> {
        let entry = self
            .entries
            .write()
            .await
            .remove(name)
            .ok_or_else(|| RegistryError::NotWatched(name.to_string()))?;
        entry.retired.store(true, Ordering::SeqCst);
        if let Some(handle) = entry.watcher.lock().await.take() {
            handle.stop();
        }
        let _commit = entry.commit.lock().await;
        self.cache.remove(name).await;
        self.hub
            .broadcast(WireMsg::Unwatched(UnwatchedPayload {
                repository: name.to_string(),
            }))
            .await;
        info!(event = "repository_unwatched", repository = %name);
        Ok(())
    }

    pub async fn spec(&self, name: &str) -> Option<RepositorySpec> {
        self.entries
            .read()
            .await
            .get(name)
            .map(|entry| entry.spec.clone())
    }

    pub async fn list(&self) -> Vec<RepositoryInfo> {
        let entries: Vec<Arc<RepositoryEntry>> =
            self.entries.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(entries.len());
        for entry in entries {
            let snapshot = self.cache.get(&entry.spec.name).await;
            infos.push(RepositoryInfo {
                name: entry.spec.name.clone(),
                root: entry.spec.root.clone(),
                revision: snapshot.as_ref().map(|s| s.revision).unwrap_or(0),
                stats: snapshot.map(|s| s.stats.clone()).unwrap_or_default(),
            });
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Requests a cycle. Returns the outcome of the last cycle this call
    /// drove, or `Coalesced` when a running cycle will pick the request up.
    pub async fn trigger(&self, name: &str) -> CycleOutcome {
        let Some(entry) = self.entries.read().await.get(name).cloned() else {
            debug!(event = "trigger_unknown", repository = %name);
            return CycleOutcome::Failed;
        };
        if !entry.gate.request() {
            debug!(event = "trigger_coalesced", repository = %name);
            return CycleOutcome::Coalesced;
        }
        let mut outcome = CycleOutcome::Coalesced;
        loop {
            while entry.gate.take_pending() {
                outcome = self.run_cycle(&entry).await;
            }
            if !entry.gate.release() {
                break;
            }
        }
        outcome
    }

    async fn run_cycle(&self, entry: &RepositoryEntry) -> CycleOutcome {
        let name = &entry.spec.name;
        let scanned = scan_repository(&entry.spec, &entry.include).await;
        let _commit = entry.commit.lock().await;
        if entry.retired.load(Ordering::SeqCst) {
            debug!(event = "cycle_retired", repository = %name);
            return CycleOutcome::Retired;
        }
        let report = match scanned {
            Ok(report) => report,
            Err(err) => {
                warn!(event = "scan_failed", repository = %name, error = %err);
                self.report(Diagnostic::new(
                    name,
                    DiagnosticKind::Scan,
                    None,
                    err.to_string(),
                ))
                .await;
                return CycleOutcome::Failed;
            }
        };
        for diagnostic in report.diagnostics {
            self.report(diagnostic).await;
        }

        let previous = self.cache.get(name).await;
        let first = previous.is_none();
        let previous = previous.unwrap_or_else(|| Arc::new(RepositorySnapshot::empty(name)));
        let mut next = report.snapshot;
        for (path, message) in reconcile(&previous, &mut next, Utc::now()) {
            self.report(Diagnostic::new(name, DiagnosticKind::Parse, Some(path), message))
                .await;
        }

        let changes = diff(&previous, &next);
        if first {
            return self.announce(next, changes.len(), report.files).await;
        }
        if changes.is_empty() {
            debug!(event = "cycle_unchanged", repository = %name, files = report.files);
            return CycleOutcome::Unchanged {
                revision: previous.revision,
            };
        }

        next.revision = previous.revision + 1;
        let revision = next.revision;
        let stats = next.stats.clone();
        self.cache.replace(next).await;
        let count = changes.len();
        self.hub
            .broadcast(WireMsg::Update(UpdatePayload {
                repository: name.clone(),
                revision,
                changes,
                stats,
            }))
            .await;
        info!(
            event = "cycle_complete",
            repository = %name,
            revision = revision,
            changes = count,
            files = report.files
        );
        CycleOutcome::Changed {
            revision,
            changes: count,
        }
    }

    /// First snapshot of a repository: clients have never seen it, so they
    /// get the whole thing rather than a change list.
    async fn announce(&self, mut next: RepositorySnapshot, changes: usize, files: usize) -> CycleOutcome {
        next.revision = u64::from(changes > 0);
        let revision = next.revision;
        let snapshot = self.cache.replace(next).await;
        self.hub
            .broadcast(WireMsg::Snapshot(SnapshotPayload {
                snapshot: snapshot.as_ref().clone(),
            }))
            .await;
        info!(
            event = "repository_announced",
            repository = %snapshot.repository,
            revision = revision,
            files = files
        );
        if changes == 0 {
            CycleOutcome::Unchanged { revision }
        } else {
            CycleOutcome::Changed { revision, changes }
        }
    }

    async fn report(&self, diagnostic: Diagnostic) {
        debug!(
            event = "diagnostic",
            repository = %diagnostic.repository,
            kind = %diagnostic.kind,
            message = %diagnostic.message
        );
        self.cache.record(diagnostic.clone()).await;
        self.hub.broadcast(WireMsg::Diagnostic(diagnostic)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::HubConfig;
    use std::path::Path;

    const INDEX: &str = "_work_efforts/WE-260101-ab12_parser/WE-260101-ab12_index.md";

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, contents).expect("write");
    }

    fn registry() -> Arc<Registry> {
        let hub = Arc::new(Hub::new(HubConfig::default(), Arc::new(StateCache::new())));
        Registry::new(hub, WatchSettings::default())
    }

    #[tokio::test]
    async fn revision_moves_only_when_content_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), INDEX, "---\nid: WE-260101-ab12\ntitle: Parser\n---\n");
        let registry = registry();

        let outcome = registry
            .track(RepositorySpec::new("demo", dir.path()))
            .await
            .expect("track");
        assert_eq!(outcome, CycleOutcome::Changed { revision: 1, changes: 1 });

        assert_eq!(
            registry.trigger("demo").await,
            CycleOutcome::Unchanged { revision: 1 }
        );

        write(
            dir.path(),
            INDEX,
            "---\nid: WE-260101-ab12\ntitle: Parser\nstatus: completed\n---\n",
        );
        assert_eq!(
            registry.trigger("demo").await,
            CycleOutcome::Changed { revision: 2, changes: 1 }
        );
        let snapshot = registry.cache().get("demo").await.expect("cached");
        assert_eq!(snapshot.revision, 2);
        assert!(snapshot.work_efforts["WE-260101-ab12"].last_updated.is_some());
    }

    #[tokio::test]
    async fn failed_scan_keeps_last_good_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("repo");
        write(&root, INDEX, "---\nid: WE-260101-ab12\n---\n");
        let registry = registry();
        registry
            .track(RepositorySpec::new("demo", &root))
            .await
            .expect("track");

        std::fs::remove_dir_all(&root).expect("remove");
        assert_eq!(registry.trigger("demo").await, CycleOutcome::Failed);
        let snapshot = registry.cache().get("demo").await.expect("retained");
        assert_eq!(snapshot.work_efforts.len(), 1);
        let diagnostics = registry.cache().diagnostics(Some("demo")).await;
        assert!(diagnostics.iter().any(|d| d.kind == DiagnosticKind::Scan));
    }

    #[tokio::test]
    async fn unwatch_discards_a_cycle_already_scanning() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), INDEX, "---\nid: WE-260101-ab12\ntitle: Parser\n---\n");
        let registry = registry();
        registry
            .track(RepositorySpec::new("demo", dir.path()))
            .await
            .expect("track");
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        registry.hub.attach(tx).await;
        let _init = rx.try_recv().expect("init");

        write(
            dir.path(),
            INDEX,
            "---\nid: WE-260101-ab12\ntitle: Parser\nstatus: blocked\n---\n",
        );
        let entry = registry.entries.read().await.get("demo").cloned().expect("entry");
        let held = entry.commit.lock().await;

        let cycling = registry.clone();
        let cycle = tokio::spawn(async move { cycling.trigger("demo").await });
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        let unwatching = registry.clone();
        let unwatch = tokio::spawn(async move { unwatching.unwatch("demo").await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        drop(held);

        assert_eq!(cycle.await.expect("join"), CycleOutcome::Retired);
        unwatch.await.expect("join").expect("unwatch");
        assert!(registry.cache().get("demo").await.is_none());

        let mut kinds = Vec::new();
        while let Ok(axum::extract::ws::Message::Text(text)) = rx.try_recv() {
            let envelope: pyrite_core::protocol::WireEnvelope =
                serde_json::from_str(&text).expect("frame");
            kinds.push(envelope.msg.type_name());
        }
        assert_eq!(kinds, vec!["unwatched"]);
    }

    #[tokio::test]
    async fn empty_repository_is_still_announced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry();
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        registry.hub.attach(tx).await;
        let _init = rx.try_recv().expect("init");

        let outcome = registry
            .track(RepositorySpec::new("empty", dir.path()))
            .await
            .expect("track");
        assert_eq!(outcome, CycleOutcome::Unchanged { revision: 0 });
        let Ok(axum::extract::ws::Message::Text(text)) = rx.try_recv() else {
            panic!("expected a snapshot frame");
        };
        let envelope: pyrite_core::protocol::WireEnvelope =
            serde_json::from_str(&text).expect("frame");
        match envelope.msg {
            WireMsg::Snapshot(payload) => {
                assert_eq!(payload.snapshot.repository, "empty");
                assert_eq!(payload.snapshot.revision, 0);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_and_unknown_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry();
        registry
            .track(RepositorySpec::new("demo", dir.path()))
            .await
            .expect("track");
        assert!(matches!(
            registry.track(RepositorySpec::new("demo", dir.path())).await,
            Err(RegistryError::AlreadyWatched(_))
        ));
        assert!(matches!(
            registry.unwatch("missing").await,
            Err(RegistryError::NotWatched(_))
        ));
        registry.unwatch("demo").await.expect("unwatch");
        assert!(registry.cache().get("demo").await.is_none());
        assert!(registry.list().await.is_empty());
    }
}
