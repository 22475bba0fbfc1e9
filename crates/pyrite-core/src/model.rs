use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    #[default]
    Pending,
    Active,
    Completed,
    Paused,
    Blocked,
}

impl WorkStatus {
    pub const ALL: [WorkStatus; 5] = [
        WorkStatus::Pending,
        WorkStatus::Active,
        WorkStatus::Completed,
        WorkStatus::Paused,
        WorkStatus::Blocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Active => "active",
            WorkStatus::Completed => "completed",
            WorkStatus::Paused => "paused",
            WorkStatus::Blocked => "blocked",
        }
    }

    /// Permissive variant of `from_str`: unknown input falls back to `pending`
    /// and yields a diagnostic message.
    pub fn coerce(input: &str) -> (Self, Option<String>) {
        match input.parse() {
            Ok(status) => (status, None),
            Err(err) => (WorkStatus::Pending, Some(format!("{err}; using pending"))),
        }
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "pending" | "todo" | "open" => Ok(WorkStatus::Pending),
            "active" | "in_progress" | "in-progress" | "inprogress" => Ok(WorkStatus::Active),
            "completed" | "complete" | "done" => Ok(WorkStatus::Completed),
            "paused" | "on_hold" | "on-hold" => Ok(WorkStatus::Paused),
            "blocked" => Ok(WorkStatus::Blocked),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    #[default]
    Pending,
    InProgress,
    Active,
    Completed,
    Paused,
    Blocked,
}

impl TicketStatus {
    pub const ALL: [TicketStatus; 6] = [
        TicketStatus::Pending,
        TicketStatus::InProgress,
        TicketStatus::Active,
        TicketStatus::Completed,
        TicketStatus::Paused,
        TicketStatus::Blocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Pending => "pending",
            TicketStatus::InProgress => "in_progress",
            TicketStatus::Active => "active",
            TicketStatus::Completed => "completed",
            TicketStatus::Paused => "paused",
            TicketStatus::Blocked => "blocked",
        }
    }

    pub fn coerce(input: &str) -> (Self, Option<String>) {
        match input.parse() {
            Ok(status) => (status, None),
            Err(err) => (TicketStatus::Pending, Some(format!("{err}; using pending"))),
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "pending" | "todo" | "open" => Ok(TicketStatus::Pending),
            "in_progress" | "in-progress" | "inprogress" => Ok(TicketStatus::InProgress),
            "active" => Ok(TicketStatus::Active),
            "completed" | "complete" | "done" => Ok(TicketStatus::Completed),
            "paused" | "on_hold" | "on-hold" => Ok(TicketStatus::Paused),
            "blocked" => Ok(TicketStatus::Blocked),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// A `## Heading` block of a markdown body. Content is kept as written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Section {
    pub heading: String,
    pub content: String,
}

fn find_section<'a>(sections: &'a [Section], names: &[&str]) -> Option<&'a str> {
    sections
        .iter()
        .find(|section| {
            names
                .iter()
                .any(|name| section.heading.eq_ignore_ascii_case(name))
        })
        .map(|section| section.content.as_str())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkEffort {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub status: WorkStatus,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub tickets: Vec<String>,
    #[serde(default)]
    pub sections: Vec<Section>,
}

impl WorkEffort {
    pub fn objective(&self) -> Option<&str> {
        find_section(&self.sections, &["objective", "objectives"])
    }

    pub fn progress(&self) -> Option<&str> {
        find_section(&self.sections, &["progress", "progress notes", "notes"])
    }

    pub fn commits(&self) -> Option<&str> {
        find_section(&self.sections, &["commits", "commit log"])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: String,
    pub parent: String,
    pub title: String,
    #[serde(default)]
    pub status: TicketStatus,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub sections: Vec<Section>,
}

impl Ticket {
    pub fn description(&self) -> Option<&str> {
        find_section(&self.sections, &["description"])
    }

    pub fn acceptance_criteria(&self) -> Option<&str> {
        find_section(&self.sections, &["acceptance criteria"])
    }

    pub fn implementation_notes(&self) -> Option<&str> {
        find_section(&self.sections, &["implementation notes", "notes"])
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    WorkEffort,
    Ticket,
}

impl EntityKind {
    /// Namespace used for bus event names (`workeffort:*`, `ticket:*`).
    pub fn namespace(&self) -> &'static str {
        match self {
            EntityKind::WorkEffort => "workeffort",
            EntityKind::Ticket => "ticket",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::WorkEffort => f.write_str("workEffort"),
            EntityKind::Ticket => f.write_str("ticket"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Entity {
    WorkEffort(WorkEffort),
    Ticket(Ticket),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::WorkEffort(_) => EntityKind::WorkEffort,
            Entity::Ticket(_) => EntityKind::Ticket,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Entity::WorkEffort(we) => &we.id,
            Entity::Ticket(ticket) => &ticket.id,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Entity::WorkEffort(we) => &we.title,
            Entity::Ticket(ticket) => &ticket.title,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Entity::WorkEffort(we) => &we.path,
            Entity::Ticket(ticket) => &ticket.path,
        }
    }

    pub fn status_str(&self) -> &'static str {
        match self {
            Entity::WorkEffort(we) => we.status.as_str(),
            Entity::Ticket(ticket) => ticket.status.as_str(),
        }
    }
}

fn work_effort_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^WE-(\d{4,8})-([A-Za-z0-9]{2,})$").expect("valid regex"))
}

fn ticket_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^TKT-([A-Za-z0-9]{2,})-(\d{1,6})$").expect("valid regex"))
}

pub fn is_work_effort_id(id: &str) -> bool {
    work_effort_id_pattern().is_match(id)
}

pub fn is_ticket_id(id: &str) -> bool {
    ticket_id_pattern().is_match(id)
}

/// Numeric suffix of a ticket identifier (`TKT-ab12-007` → 7).
pub fn ticket_sequence(id: &str) -> Option<u32> {
    ticket_id_pattern()
        .captures(id)
        .and_then(|captures| captures.get(2))
        .and_then(|m| m.as_str().parse().ok())
}
