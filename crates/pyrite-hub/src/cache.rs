use pyrite_core::{Diagnostic, DiagnosticLog, RepositorySnapshot};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::RwLock;

/// Latest snapshot per repository plus the recent diagnostics ring.
///
/// Snapshots are swapped whole, so readers never observe a half-applied
/// cycle.
#[derive(Default)]
pub struct StateCache {
    snapshots: RwLock<HashMap<String, Arc<RepositorySnapshot>>>,
    diagnostics: RwLock<DiagnosticLog>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, repository: &str) -> Option<Arc<RepositorySnapshot>> {
        self.snapshots.read().await.get(repository).cloned()
    }

    pub async fn replace(&self, snapshot: RepositorySnapshot) -> Arc<RepositorySnapshot> {
        let snapshot = Arc::new(snapshot);
        self.snapshots
            .write()
            .await
            .insert(snapshot.repository.clone(), snapshot.clone());
        snapshot
    }

    pub async fn remove(&self, repository: &str) -> Option<Arc<RepositorySnapshot>> {
        self.snapshots.write().await.remove(repository)
    }

    /// Owned copy of every snapshot, keyed by repository name.
    pub async fn all(&self) -> BTreeMap<String, RepositorySnapshot> {
        self.snapshots
            .read()
            .await
            .iter()
            .map(|(name, snapshot)| (name.clone(), snapshot.as_ref().clone()))
            .collect()
    }

    pub async fn record(&self, diagnostic: Diagnostic) {
        self.diagnostics.write().await.push(diagnostic);
    }

    pub async fn diagnostics(&self, repository: Option<&str>) -> Vec<Diagnostic> {
        let log = self.diagnostics.read().await;
        match repository {
            Some(name) => log.for_repository(name).cloned().collect(),
            None => log.entries().cloned().collect(),
        }
    }
}

/// At most one cycle runs per repository; triggers that land while one is
/// running collapse into a single follow-up cycle.
#[derive(Debug, Default)]
pub struct CycleGate {
    busy: AtomicBool,
    pending: AtomicBool,
}

impl CycleGate {
    /// Marks work pending. Returns true when the caller now owns the gate and
    /// must drive cycles until [`CycleGate::release`] says otherwise.
    pub fn request(&self) -> bool {
        self.pending.store(true, Ordering::SeqCst);
        self.acquire()
    }

    pub fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }

    /// Gives the gate up. Returns true when a trigger slipped in after the
    /// last `take_pending` and the caller re-acquired the gate.
    pub fn release(&self) -> bool {
        self.busy.store(false, Ordering::SeqCst);
        self.pending.load(Ordering::SeqCst) && self.acquire()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn acquire(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}
