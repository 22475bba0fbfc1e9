//! Immutable per-repository snapshots and the pure diff between two of them.

use crate::model::{ticket_sequence, Entity, EntityKind, Ticket, TicketStatus, WorkEffort, WorkStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryStats {
    pub work_efforts: usize,
    pub tickets: usize,
    #[serde(default)]
    pub work_efforts_by_status: BTreeMap<WorkStatus, usize>,
    #[serde(default)]
    pub tickets_by_status: BTreeMap<TicketStatus, usize>,
}

impl RepositoryStats {
    pub fn compute(
        work_efforts: &BTreeMap<String, WorkEffort>,
        tickets: &BTreeMap<String, Ticket>,
    ) -> Self {
        let mut stats = RepositoryStats {
            work_efforts: work_efforts.len(),
            tickets: tickets.len(),
            ..Default::default()
        };
        for we in work_efforts.values() {
            *stats.work_efforts_by_status.entry(we.status).or_default() += 1;
        }
        for ticket in tickets.values() {
            *stats.tickets_by_status.entry(ticket.status).or_default() += 1;
        }
        stats
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySnapshot {
    pub repository: String,
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub work_efforts: BTreeMap<String, WorkEffort>,
    #[serde(default)]
    pub tickets: BTreeMap<String, Ticket>,
    #[serde(default)]
    pub stats: RepositoryStats,
}

impl RepositorySnapshot {
    pub fn empty(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            ..Default::default()
        }
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> Option<Entity> {
        match kind {
            EntityKind::WorkEffort => self.work_efforts.get(id).cloned().map(Entity::WorkEffort),
            EntityKind::Ticket => self.tickets.get(id).cloned().map(Entity::Ticket),
        }
    }

    pub fn refresh_stats(&mut self) {
        self.stats = RepositoryStats::compute(&self.work_efforts, &self.tickets);
    }

    /// Same entities and stats, ignoring `revision`.
    pub fn same_content(&self, other: &RepositorySnapshot) -> bool {
        self.repository == other.repository
            && self.work_efforts == other.work_efforts
            && self.tickets == other.tickets
            && self.stats == other.stats
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Created,
    Updated,
    Removed,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Created => "created",
            ChangeAction::Updated => "updated",
            ChangeAction::Removed => "removed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ChangeEvent {
    Created { entity: Entity },
    Updated { entity: Entity },
    Removed { kind: EntityKind, id: String },
}

impl ChangeEvent {
    pub fn action(&self) -> ChangeAction {
        match self {
            ChangeEvent::Created { .. } => ChangeAction::Created,
            ChangeEvent::Updated { .. } => ChangeAction::Updated,
            ChangeEvent::Removed { .. } => ChangeAction::Removed,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            ChangeEvent::Created { entity } | ChangeEvent::Updated { entity } => entity.kind(),
            ChangeEvent::Removed { kind, .. } => *kind,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ChangeEvent::Created { entity } | ChangeEvent::Updated { entity } => entity.id(),
            ChangeEvent::Removed { id, .. } => id,
        }
    }

    pub fn entity(&self) -> Option<&Entity> {
        match self {
            ChangeEvent::Created { entity } | ChangeEvent::Updated { entity } => Some(entity),
            ChangeEvent::Removed { .. } => None,
        }
    }
}

/// Collects parsed entities for one cycle and resolves cross-file rules.
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    repository: String,
    work_efforts: BTreeMap<String, WorkEffort>,
    tickets: BTreeMap<String, Ticket>,
    diagnostics: Vec<(String, String)>,
}

impl SnapshotBuilder {
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            ..Default::default()
        }
    }

    /// First file wins on duplicate identifiers; later ones are reported.
    pub fn insert(&mut self, entity: Entity) {
        match entity {
            Entity::WorkEffort(mut we) => {
                if let Some(existing) = self.work_efforts.get(&we.id) {
                    let message = format!("duplicate work effort {} (kept {})", we.id, existing.path);
                    self.diagnostics.push((we.path, message));
                    return;
                }
                we.repository = self.repository.clone();
                we.tickets.clear();
                self.work_efforts.insert(we.id.clone(), we);
            }
            Entity::Ticket(ticket) => {
                if let Some(existing) = self.tickets.get(&ticket.id) {
                    let message = format!("duplicate ticket {} (kept {})", ticket.id, existing.path);
                    self.diagnostics.push((ticket.path, message));
                    return;
                }
                self.tickets.insert(ticket.id.clone(), ticket);
            }
        }
    }

    /// Returns the snapshot plus `(path, message)` diagnostics.
    pub fn build(mut self) -> (RepositorySnapshot, Vec<(String, String)>) {
        let orphans: Vec<String> = self
            .tickets
            .values()
            .filter(|ticket| !self.work_efforts.contains_key(&ticket.parent))
            .map(|ticket| ticket.id.clone())
            .collect();
        for id in orphans {
            if let Some(ticket) = self.tickets.remove(&id) {
                let message = format!(
                    "ticket {} references unknown work effort {}",
                    ticket.id, ticket.parent
                );
                self.diagnostics.push((ticket.path, message));
            }
        }

        let mut snapshot = RepositorySnapshot {
            repository: self.repository,
            revision: 0,
            work_efforts: self.work_efforts,
            tickets: self.tickets,
            stats: RepositoryStats::default(),
        };
        link_tickets(&mut snapshot);
        snapshot.refresh_stats();
        (snapshot, self.diagnostics)
    }
}

fn link_tickets(snapshot: &mut RepositorySnapshot) {
    for we in snapshot.work_efforts.values_mut() {
        we.tickets.clear();
    }
    for ticket in snapshot.tickets.values() {
        if let Some(we) = snapshot.work_efforts.get_mut(&ticket.parent) {
            we.tickets.push(ticket.id.clone());
        }
    }
    for we in snapshot.work_efforts.values_mut() {
        we.tickets
            .sort_by_key(|id| (ticket_sequence(id).unwrap_or(u32::MAX), id.clone()));
    }
}

/// Carries cross-cycle invariants from `previous` into a freshly built `next`:
/// ticket parents never change, and a status change always moves
/// `last_updated` forward. Returns `(path, message)` diagnostics.
pub fn reconcile(
    previous: &RepositorySnapshot,
    next: &mut RepositorySnapshot,
    now: DateTime<Utc>,
) -> Vec<(String, String)> {
    let mut diagnostics = Vec::new();

    let mut relinked = false;
    let mut dropped = Vec::new();
    for ticket in next.tickets.values_mut() {
        let Some(old) = previous.tickets.get(&ticket.id) else {
            continue;
        };
        if old.parent != ticket.parent {
            diagnostics.push((
                ticket.path.clone(),
                format!(
                    "ticket {} cannot move from {} to {}; keeping original parent",
                    ticket.id, old.parent, ticket.parent
                ),
            ));
            ticket.parent = old.parent.clone();
            relinked = true;
            if !next.work_efforts.contains_key(&ticket.parent) {
                dropped.push(ticket.id.clone());
            }
        }
        ticket.last_updated = carry_timestamp(
            old.status != ticket.status,
            old.last_updated,
            ticket.last_updated,
            now,
        );
    }
    for id in dropped {
        if let Some(ticket) = next.tickets.remove(&id) {
            diagnostics.push((
                ticket.path,
                format!("ticket {id} dropped: original parent {} is gone", ticket.parent),
            ));
        }
    }
    if relinked {
        link_tickets(next);
    }

    for we in next.work_efforts.values_mut() {
        if let Some(old) = previous.work_efforts.get(&we.id) {
            we.last_updated =
                carry_timestamp(old.status != we.status, old.last_updated, we.last_updated, now);
        }
    }

    next.refresh_stats();
    diagnostics
}

fn carry_timestamp(
    status_changed: bool,
    old: Option<DateTime<Utc>>,
    new: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match (old, new) {
        (Some(old), Some(new)) if new > old => Some(new),
        (None, Some(new)) => Some(new),
        _ if status_changed => Some(now),
        (old, new) => old.or(new),
    }
}

/// Ordered change list turning `old` into `new`.
pub fn diff(old: &RepositorySnapshot, new: &RepositorySnapshot) -> Vec<ChangeEvent> {
    let mut we_created = Vec::new();
    let mut we_updated = Vec::new();
    let mut we_removed = Vec::new();
    let mut ticket_created = Vec::new();
    let mut ticket_updated = Vec::new();
    let mut ticket_removed = Vec::new();
    let mut touched_parents: BTreeSet<&str> = BTreeSet::new();

    for (id, ticket) in &new.tickets {
        match old.tickets.get(id) {
            None => {
                ticket_created.push(ChangeEvent::Created {
                    entity: Entity::Ticket(ticket.clone()),
                });
                touched_parents.insert(ticket.parent.as_str());
            }
            Some(previous) if previous != ticket => {
                ticket_updated.push(ChangeEvent::Updated {
                    entity: Entity::Ticket(ticket.clone()),
                });
                touched_parents.insert(ticket.parent.as_str());
                touched_parents.insert(previous.parent.as_str());
            }
            Some(_) => {}
        }
    }
    for (id, ticket) in &old.tickets {
        if !new.tickets.contains_key(id) {
            ticket_removed.push(ChangeEvent::Removed {
                kind: EntityKind::Ticket,
                id: id.clone(),
            });
            touched_parents.insert(ticket.parent.as_str());
        }
    }

    for (id, we) in &new.work_efforts {
        match old.work_efforts.get(id) {
            None => we_created.push(ChangeEvent::Created {
                entity: Entity::WorkEffort(we.clone()),
            }),
            Some(previous) if previous != we || touched_parents.contains(id.as_str()) => {
                we_updated.push(ChangeEvent::Updated {
                    entity: Entity::WorkEffort(we.clone()),
                });
            }
            Some(_) => {}
        }
    }
    for id in old.work_efforts.keys() {
        if !new.work_efforts.contains_key(id) {
            we_removed.push(ChangeEvent::Removed {
                kind: EntityKind::WorkEffort,
                id: id.clone(),
            });
        }
    }

    let mut changes = we_created;
    changes.append(&mut ticket_created);
    changes.append(&mut ticket_updated);
    changes.append(&mut we_updated);
    changes.append(&mut ticket_removed);
    changes.append(&mut we_removed);
    changes
}

/// Applies changes by identifier. Re-applying the same list is a no-op.
/// Returns whether anything in the snapshot changed.
pub fn apply(snapshot: &mut RepositorySnapshot, changes: &[ChangeEvent]) -> bool {
    let mut changed = false;
    for change in changes {
        changed |= apply_one(snapshot, change);
    }
    if changed {
        snapshot.refresh_stats();
    }
    changed
}

/// Applies a single change; returns whether the snapshot differs afterwards.
pub fn apply_one(snapshot: &mut RepositorySnapshot, change: &ChangeEvent) -> bool {
    match change {
        ChangeEvent::Created { entity } | ChangeEvent::Updated { entity } => match entity {
            Entity::WorkEffort(we) => {
                if snapshot.work_efforts.get(&we.id) == Some(we) {
                    return false;
                }
                snapshot.work_efforts.insert(we.id.clone(), we.clone());
                true
            }
            Entity::Ticket(ticket) => {
                if snapshot.tickets.get(&ticket.id) == Some(ticket) {
                    return false;
                }
                snapshot.tickets.insert(ticket.id.clone(), ticket.clone());
                true
            }
        },
        ChangeEvent::Removed { kind, id } => match kind {
            EntityKind::WorkEffort => snapshot.work_efforts.remove(id).is_some(),
            EntityKind::Ticket => snapshot.tickets.remove(id).is_some(),
        },
    }
}
