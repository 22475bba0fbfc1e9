//! Shared types for the work-effort sync pipeline: the entity model, the
//! markdown parser, snapshot diffing and the hub ↔ client wire protocol.

pub mod backoff;
pub mod diagnostics;
pub mod model;
pub mod parser;
pub mod protocol;
pub mod snapshot;

pub use backoff::{next_backoff, INITIAL_BACKOFF, MAX_BACKOFF};
pub use diagnostics::{Diagnostic, DiagnosticKind, DiagnosticLog};
pub use model::{
    is_ticket_id, is_work_effort_id, ticket_sequence, Entity, EntityKind, Section, Ticket,
    TicketStatus, WorkEffort, WorkStatus,
};
pub use parser::{
    is_frontmatter_close, is_frontmatter_open, parse_document, split_frontmatter, ParseFailure,
    Parsed,
};
pub use snapshot::{
    apply, apply_one, diff, reconcile, ChangeAction, ChangeEvent, RepositorySnapshot, RepositoryStats,
    SnapshotBuilder,
};
