use crate::bus::{BusEvent, EventBus};
use pyrite_core::protocol::{ErrorPayload, InitPayload, SnapshotPayload, UpdatePayload, WireMsg};
use pyrite_core::{apply_one, ChangeEvent, Diagnostic, RepositorySnapshot};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub const STORE_SYNCED: &str = "store:synced";
pub const STORE_DESYNC: &str = "store:desync";
pub const REPOSITORY_ADDED: &str = "repository:added";
pub const REPOSITORY_REMOVED: &str = "repository:removed";
pub const HUB_ERROR: &str = "hub:error";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { published: usize },
    /// Already seen this revision; nothing changed.
    Duplicate,
    /// The mirror can't be trusted; ask the hub for a fresh `init`.
    ResyncRequired { reason: String },
    Ignored,
}

impl ApplyOutcome {
    pub fn resync_reason(&self) -> Option<&str> {
        match self {
            ApplyOutcome::ResyncRequired { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Local mirror of the hub's snapshots; republishes applied changes on the
/// bus as typed events.
#[derive(Default)]
pub struct ClientStore {
    repositories: BTreeMap<String, RepositorySnapshot>,
    epoch: u64,
    bus: EventBus,
}

impl ClientStore {
    pub fn new(bus: EventBus) -> Self {
        Self {
            repositories: BTreeMap::new(),
            epoch: 0,
            bus,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut EventBus {
        &mut self.bus
    }

    pub fn repository(&self, name: &str) -> Option<&RepositorySnapshot> {
        self.repositories.get(name)
    }

    pub fn repositories(&self) -> &BTreeMap<String, RepositorySnapshot> {
        &self.repositories
    }

    pub fn handle_message(&mut self, msg: WireMsg) -> ApplyOutcome {
        match msg {
            WireMsg::Init(init) => self.apply_init(init),
            WireMsg::Snapshot(snapshot) => self.apply_snapshot(snapshot),
            WireMsg::Update(update) => self.apply_update(update),
            WireMsg::Unwatched(unwatched) => self.apply_unwatched(&unwatched.repository),
            WireMsg::Diagnostic(diagnostic) => self.apply_diagnostic(diagnostic),
            WireMsg::Error(error) => self.apply_error(error),
            other => {
                debug!(event = "unexpected_message", message_type = other.type_name());
                ApplyOutcome::Ignored
            }
        }
    }

    /// Replaces every named repository wholesale. Repositories the hub no
    /// longer reports are dropped.
    pub fn apply_init(&mut self, init: InitPayload) -> ApplyOutcome {
        let gone: Vec<String> = self
            .repositories
            .keys()
            .filter(|name| !init.repositories.contains_key(*name))
            .cloned()
            .collect();
        let count = init.repositories.len();
        self.repositories = init.repositories;
        self.epoch += 1;
        let mut published = 0;
        for name in gone {
            self.bus
                .publish(BusEvent::new(REPOSITORY_REMOVED).with_repository(name));
            published += 1;
        }
        self.bus.publish(
            BusEvent::new(STORE_SYNCED).with_message(format!("{count} repositories")),
        );
        info!(event = "store_synced", repositories = count);
        ApplyOutcome::Applied {
            published: published + 1,
        }
    }

    /// Adopts one repository's full state. Replaces any mirror of the same
    /// name, since the hub only sends this when it starts tracking it.
    pub fn apply_snapshot(&mut self, payload: SnapshotPayload) -> ApplyOutcome {
        let snapshot = payload.snapshot;
        let name = snapshot.repository.clone();
        let revision = snapshot.revision;
        let added = self.repositories.insert(name.clone(), snapshot).is_none();
        self.epoch += 1;
        info!(event = "store_repository", repository = %name, revision = revision, added = added);
        if !added {
            return ApplyOutcome::Applied { published: 0 };
        }
        let mut event = BusEvent::new(REPOSITORY_ADDED).with_repository(&name);
        event.revision = revision;
        event.epoch = self.epoch;
        self.bus.publish(event);
        ApplyOutcome::Applied { published: 1 }
    }

    pub fn apply_update(&mut self, update: UpdatePayload) -> ApplyOutcome {
        let Some(snapshot) = self.repositories.get_mut(&update.repository) else {
            let reason = format!("update for unknown repository {}", update.repository);
            warn!(event = "store_desync", repository = %update.repository);
            self.bus.publish(
                BusEvent::new(STORE_DESYNC)
                    .with_repository(&update.repository)
                    .with_message(&reason),
            );
            return ApplyOutcome::ResyncRequired { reason };
        };
        if update.revision <= snapshot.revision {
            debug!(
                event = "store_duplicate",
                repository = %update.repository,
                revision = update.revision,
                known = snapshot.revision
            );
            return ApplyOutcome::Duplicate;
        }
        let gap = update.revision > snapshot.revision + 1;

        let mut events = Vec::new();
        for change in &update.changes {
            let previous_status = snapshot
                .get(change.kind(), change.id())
                .map(|entity| entity.status_str());
            apply_one(snapshot, change);
            let mut event =
                change_event(&update.repository, update.revision, change, previous_status);
            event.epoch = self.epoch;
            events.push(event);
        }
        snapshot.revision = update.revision;
        snapshot.stats = update.stats;

        let published = events.len();
        for event in events {
            self.bus.publish(event);
        }

        if gap {
            let reason = format!(
                "revision gap on {}: jumped to {}",
                update.repository, update.revision
            );
            warn!(event = "store_gap", repository = %update.repository, revision = update.revision);
            return ApplyOutcome::ResyncRequired { reason };
        }
        ApplyOutcome::Applied { published }
    }

    pub fn apply_unwatched(&mut self, repository: &str) -> ApplyOutcome {
        if self.repositories.remove(repository).is_none() {
            return ApplyOutcome::Duplicate;
        }
        self.bus
            .publish(BusEvent::new(REPOSITORY_REMOVED).with_repository(repository));
        ApplyOutcome::Applied { published: 1 }
    }

    pub fn apply_diagnostic(&mut self, diagnostic: Diagnostic) -> ApplyOutcome {
        let mut event = BusEvent::new(format!("diagnostic:{}", diagnostic.kind))
            .with_repository(&diagnostic.repository)
            .with_message(&diagnostic.message);
        event.id = diagnostic.path.clone();
        event.at = diagnostic.at;
        self.bus.publish(event);
        ApplyOutcome::Applied { published: 1 }
    }

    /// The hub reports errors just before it drops the connection, e.g. when
    /// the initial state does not fit in a frame.
    pub fn apply_error(&mut self, error: ErrorPayload) -> ApplyOutcome {
        warn!(event = "hub_error", code = %error.code, message = %error.message);
        let mut event = BusEvent::new(HUB_ERROR).with_message(&error.message);
        event.id = Some(error.code);
        self.bus.publish(event);
        ApplyOutcome::Applied { published: 1 }
    }
}

/// Bus name for one applied change: `created`, `removed`, the new status when
/// it moved, otherwise `updated`.
pub fn event_name(change: &ChangeEvent, previous_status: Option<&str>) -> String {
    let namespace = change.kind().namespace();
    let sub = match change {
        ChangeEvent::Created { .. } => "created",
        ChangeEvent::Removed { .. } => "removed",
        ChangeEvent::Updated { entity } => match previous_status {
            Some(previous) if previous != entity.status_str() => entity.status_str(),
            _ => "updated",
        },
    };
    format!("{namespace}:{sub}")
}

fn change_event(
    repository: &str,
    revision: u64,
    change: &ChangeEvent,
    previous_status: Option<&'static str>,
) -> BusEvent {
    let mut event = BusEvent::new(event_name(change, previous_status)).with_repository(repository);
    event.kind = Some(change.kind());
    event.id = Some(change.id().to_string());
    event.action = Some(change.action());
    event.entity = change.entity().cloned();
    event.previous_status = previous_status.map(str::to_string);
    event.revision = revision;
    event
}
