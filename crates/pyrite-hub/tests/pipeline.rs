use axum::extract::ws::Message;
use pyrite_client::{
    AnimationController, ApplyOutcome, ClientStore, Cue, EventBus, Severity, ToastManager,
};
use pyrite_core::protocol::{decode_frame, WireEnvelope, WireMsg, DEFAULT_MAX_FRAME_BYTES};
use pyrite_core::{ChangeEvent, DiagnosticKind, EntityKind, TicketStatus};
use pyrite_hub::{CycleOutcome, Hub, HubConfig, Registry, RepositorySpec, StateCache, WatchSettings};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const INDEX: &str = "_work_efforts/WE-260101-ab12_parser/WE-260101-ab12_index.md";
const TICKET: &str = "_work_efforts/WE-260101-ab12_parser/tickets/TKT-ab12-001_frontmatter.md";

fn write(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    std::fs::write(path, contents).expect("write");
}

fn ticket(status: &str) -> String {
    format!(
        "---\nid: TKT-ab12-001\ntitle: Frontmatter parsing\nstatus: {status}\ncreated: 2026-01-01\n---\n\n## Description\n\nSplit the YAML block.\n"
    )
}

fn drain(rx: &mut mpsc::Receiver<Message>) -> Vec<WireEnvelope> {
    let mut frames = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let Message::Text(text) = message {
            frames.push(decode_frame(text.as_bytes(), DEFAULT_MAX_FRAME_BYTES).expect("frame"));
        }
    }
    frames
}

struct Monitor {
    store: ClientStore,
    toasts: Arc<Mutex<ToastManager>>,
    animations: Arc<Mutex<AnimationController>>,
}

impl Monitor {
    fn new() -> Self {
        let toasts = Arc::new(Mutex::new(ToastManager::default()));
        let animations = Arc::new(Mutex::new(AnimationController::new()));
        let mut bus = EventBus::default();
        ToastManager::attach(&mut bus, toasts.clone());
        AnimationController::attach(&mut bus, animations.clone());
        Self {
            store: ClientStore::new(bus),
            toasts,
            animations,
        }
    }

    fn feed(&mut self, frames: Vec<WireEnvelope>) -> Vec<ApplyOutcome> {
        frames
            .into_iter()
            .map(|envelope| self.store.handle_message(envelope.msg))
            .collect()
    }
}

#[tokio::test]
async fn ticket_completion_reaches_the_client_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(
        dir.path(),
        INDEX,
        "---\nid: WE-260101-ab12\ntitle: Parser\nstatus: active\n---\n\n## Objective\n\nParse work efforts.\n",
    );
    write(dir.path(), TICKET, &ticket("in_progress"));

    let hub = Arc::new(Hub::new(HubConfig::default(), Arc::new(StateCache::new())));
    let registry = Registry::new(hub.clone(), WatchSettings::default());
    let outcome = registry
        .track(RepositorySpec::new("demo", dir.path()))
        .await
        .expect("track");
    assert!(matches!(outcome, CycleOutcome::Changed { revision: 1, .. }));

    let (tx, mut rx) = mpsc::channel(16);
    hub.attach(tx).await;
    let mut monitor = Monitor::new();
    let outcomes = monitor.feed(drain(&mut rx));
    assert_eq!(outcomes.len(), 1);
    assert_eq!(
        monitor.store.repository("demo").expect("mirrored").revision,
        1
    );

    write(dir.path(), TICKET, &ticket("completed"));
    assert!(matches!(
        registry.trigger("demo").await,
        CycleOutcome::Changed { revision: 2, .. }
    ));
    let frames = drain(&mut rx);
    assert_eq!(frames.len(), 1);
    let redelivered = frames.clone();

    monitor.feed(frames);
    assert_eq!(monitor.feed(redelivered), vec![ApplyOutcome::Duplicate]);

    let mirror = monitor.store.repository("demo").expect("mirrored");
    let cached = registry.cache().get("demo").await.expect("cached");
    assert_eq!(mirror.revision, 2);
    assert_eq!(mirror.tickets, cached.tickets);
    assert_eq!(mirror.work_efforts, cached.work_efforts);
    assert_eq!(mirror.stats, cached.stats);
    assert_eq!(mirror.tickets["TKT-ab12-001"].status, TicketStatus::Completed);

    let toasts = monitor.toasts.lock().expect("toasts");
    let completions: Vec<_> = toasts
        .active()
        .iter()
        .filter(|toast| toast.severity == Severity::Success)
        .collect();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].title, "Frontmatter parsing");

    let mut animations = monitor.animations.lock().expect("animations");
    let celebrations = animations
        .drain()
        .into_iter()
        .filter(|animation| animation.cue == Cue::Celebrate)
        .count();
    assert_eq!(celebrations, 1);
}

#[tokio::test]
async fn unwatch_removes_the_mirrored_repository() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(dir.path(), INDEX, "---\nid: WE-260101-ab12\ntitle: Parser\n---\n");

    let hub = Arc::new(Hub::new(HubConfig::default(), Arc::new(StateCache::new())));
    let registry = Registry::new(hub.clone(), WatchSettings::default());
    registry
        .track(RepositorySpec::new("demo", dir.path()))
        .await
        .expect("track");

    let (tx, mut rx) = mpsc::channel(16);
    hub.attach(tx).await;
    let mut monitor = Monitor::new();
    monitor.feed(drain(&mut rx));
    assert!(monitor.store.repository("demo").is_some());

    registry.unwatch("demo").await.expect("unwatch");
    monitor.feed(drain(&mut rx));
    assert!(monitor.store.repository("demo").is_none());
    assert!(registry.cache().get("demo").await.is_none());
}

#[tokio::test]
async fn repository_tracked_after_connect_is_mirrored() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(dir.path(), INDEX, "---\nid: WE-260101-ab12\ntitle: Parser\nstatus: active\n---\n");
    write(dir.path(), TICKET, &ticket("in_progress"));
    let empty = tempfile::tempdir().expect("tempdir");

    let hub = Arc::new(Hub::new(HubConfig::default(), Arc::new(StateCache::new())));
    let registry = Registry::new(hub.clone(), WatchSettings::default());
    let (tx, mut rx) = mpsc::channel(16);
    hub.attach(tx).await;
    let mut monitor = Monitor::new();
    monitor.feed(drain(&mut rx));
    assert!(monitor.store.repositories().is_empty());

    registry
        .track(RepositorySpec::new("demo", dir.path()))
        .await
        .expect("track");
    registry
        .track(RepositorySpec::new("bare", empty.path()))
        .await
        .expect("track");
    let outcomes = monitor.feed(drain(&mut rx));
    assert!(outcomes
        .iter()
        .all(|outcome| outcome.resync_reason().is_none()));
    assert_eq!(monitor.store.repository("demo").expect("demo").revision, 1);
    assert_eq!(monitor.store.repository("bare").expect("bare").revision, 0);

    write(dir.path(), TICKET, &ticket("completed"));
    registry.trigger("demo").await;
    let outcomes = monitor.feed(drain(&mut rx));
    assert!(matches!(outcomes.as_slice(), [ApplyOutcome::Applied { .. }]));
    let mirror = monitor.store.repository("demo").expect("demo");
    let cached = registry.cache().get("demo").await.expect("cached");
    assert_eq!(mirror.revision, 2);
    assert_eq!(mirror.tickets, cached.tickets);
    assert_eq!(mirror.tickets["TKT-ab12-001"].status, TicketStatus::Completed);
}

#[tokio::test]
async fn malformed_ticket_is_removed_and_reported() {
    const OTHER: &str = "_work_efforts/WE-260101-cd34_docs/WE-260101-cd34_index.md";
    let dir = tempfile::tempdir().expect("tempdir");
    write(dir.path(), INDEX, "---\nid: WE-260101-ab12\ntitle: Parser\nstatus: active\n---\n");
    write(dir.path(), TICKET, &ticket("in_progress"));
    write(dir.path(), OTHER, "---\nid: WE-260101-cd34\ntitle: Docs\nstatus: active\n---\n");

    let hub = Arc::new(Hub::new(HubConfig::default(), Arc::new(StateCache::new())));
    let registry = Registry::new(hub.clone(), WatchSettings::default());
    registry
        .track(RepositorySpec::new("demo", dir.path()))
        .await
        .expect("track");
    let (tx, mut rx) = mpsc::channel(16);
    hub.attach(tx).await;
    let mut monitor = Monitor::new();
    monitor.feed(drain(&mut rx));
    let mirrored = monitor.store.repository("demo").expect("demo");
    let untouched = mirrored.work_efforts["WE-260101-cd34"].clone();

    write(
        dir.path(),
        TICKET,
        "---\nid: TKT-ab12-001\ntitle: Frontmatter parsing\nstatus: [oops\n---\n",
    );
    assert!(matches!(
        registry.trigger("demo").await,
        CycleOutcome::Changed { revision: 2, .. }
    ));

    let frames = drain(&mut rx);
    let update = frames
        .iter()
        .find_map(|frame| match &frame.msg {
            WireMsg::Update(update) => Some(update.clone()),
            _ => None,
        })
        .expect("update frame");
    assert!(update.changes.contains(&ChangeEvent::Removed {
        kind: EntityKind::Ticket,
        id: "TKT-ab12-001".to_string(),
    }));
    assert!(update.changes.iter().any(|change| change.id() == "WE-260101-ab12"));
    assert!(update.changes.iter().all(|change| change.id() != "WE-260101-cd34"));
    assert!(frames.iter().any(|frame| matches!(
        &frame.msg,
        WireMsg::Diagnostic(diagnostic) if diagnostic.kind == DiagnosticKind::Parse
    )));

    let diagnostics = registry.cache().diagnostics(None).await;
    assert!(diagnostics.iter().any(|diagnostic| {
        diagnostic.kind == DiagnosticKind::Parse && diagnostic.path.as_deref() == Some(TICKET)
    }));

    monitor.feed(frames);
    let mirror = monitor.store.repository("demo").expect("demo");
    assert!(!mirror.tickets.contains_key("TKT-ab12-001"));
    assert!(mirror.work_efforts["WE-260101-ab12"].tickets.is_empty());
    assert_eq!(mirror.work_efforts["WE-260101-cd34"], untouched);
    let warnings = monitor.toasts.lock().expect("toasts");
    assert!(warnings
        .active()
        .iter()
        .any(|toast| toast.severity == Severity::Warning));
}
