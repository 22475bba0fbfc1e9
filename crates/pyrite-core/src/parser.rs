//! Markdown + YAML frontmatter → [`Entity`].
//!
//! Parsing is pure: callers hand in the repository-relative path and the file
//! text. Recoverable oddities (unknown status, unparseable date) are reported
//! as diagnostics next to the entity; anything that prevents identifying the
//! entity is a [`ParseFailure`].

use crate::model::{
    is_ticket_id, is_work_effort_id, Entity, EntityKind, Section, Ticket, TicketStatus,
    WorkEffort, WorkStatus,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_yaml::{Mapping, Value};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {message}")]
pub struct ParseFailure {
    pub path: String,
    pub message: String,
}

impl ParseFailure {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
    pub entity: Entity,
    pub diagnostics: Vec<String>,
}

pub fn parse_document(path: &str, content: &str) -> Result<Parsed, ParseFailure> {
    let (yaml, body) = split_frontmatter(content)
        .ok_or_else(|| ParseFailure::new(path, "missing frontmatter block"))?;
    let frontmatter = parse_frontmatter(path, yaml)?;
    let names = FileNames::from_path(path);

    let declared_id = field_string(&frontmatter, &["id"]);
    let kind = detect_kind(&frontmatter, &names, declared_id.as_deref())
        .ok_or_else(|| ParseFailure::new(path, "cannot tell work effort from ticket"))?;

    let id = declared_id
        .or_else(|| names.derived_id(kind))
        .ok_or_else(|| ParseFailure::new(path, "missing identifier"))?;

    let mut diagnostics = Vec::new();
    let title = field_string(&frontmatter, &["title"])
        .filter(|title| !title.is_empty())
        .or_else(|| names.derived_title(kind, &id))
        .unwrap_or_else(|| id.clone());
    let created = read_date(&frontmatter, &["created", "created_at"], &mut diagnostics);
    let last_updated = read_date(
        &frontmatter,
        &["last_updated", "updated", "lastUpdated", "updated_at"],
        &mut diagnostics,
    );
    let status_raw = field_string(&frontmatter, &["status"]);
    let sections = parse_sections(body);

    let entity = match kind {
        EntityKind::WorkEffort => {
            if !is_work_effort_id(&id) {
                return Err(ParseFailure::new(
                    path,
                    format!("invalid work effort identifier: {id}"),
                ));
            }
            let status = match status_raw {
                Some(raw) => {
                    let (status, note) = WorkStatus::coerce(&raw);
                    diagnostics.extend(note);
                    status
                }
                None => WorkStatus::Pending,
            };
            Entity::WorkEffort(WorkEffort {
                id,
                title,
                status,
                created,
                last_updated,
                repository: String::new(),
                path: path.to_string(),
                tickets: Vec::new(),
                sections,
            })
        }
        EntityKind::Ticket => {
            if !is_ticket_id(&id) {
                return Err(ParseFailure::new(
                    path,
                    format!("invalid ticket identifier: {id}"),
                ));
            }
            let parent = field_string(&frontmatter, &["parent", "parent_id", "work_effort"])
                .or_else(|| names.parent_work_effort())
                .ok_or_else(|| ParseFailure::new(path, "ticket has no parent work effort"))?;
            if !is_work_effort_id(&parent) {
                return Err(ParseFailure::new(
                    path,
                    format!("invalid parent identifier: {parent}"),
                ));
            }
            let status = match status_raw {
                Some(raw) => {
                    let (status, note) = TicketStatus::coerce(&raw);
                    diagnostics.extend(note);
                    status
                }
                None => TicketStatus::Pending,
            };
            Entity::Ticket(Ticket {
                id,
                parent,
                title,
                status,
                created,
                last_updated,
                path: path.to_string(),
                sections,
            })
        }
    };

    Ok(Parsed {
        entity,
        diagnostics,
    })
}

/// Opening fence of a frontmatter block (a leading BOM is ignored).
pub fn is_frontmatter_open(line: &str) -> bool {
    line.trim_start_matches('\u{feff}').trim_end() == "---"
}

/// Closing fence: `---`, or the YAML end-of-document marker `...`.
pub fn is_frontmatter_close(line: &str) -> bool {
    matches!(line.trim_end(), "---" | "...")
}

/// Returns `(yaml, body)` when the text opens with a fenced block.
pub fn split_frontmatter(content: &str) -> Option<(&str, &str)> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut lines = content.split_inclusive('\n');
    let first = lines.next()?;
    if !is_frontmatter_open(first) {
        return None;
    }
    let yaml_start = first.len();
    let mut offset = yaml_start;
    for line in lines {
        if is_frontmatter_close(line) {
            let yaml = &content[yaml_start..offset];
            let body = &content[offset + line.len()..];
            return Some((yaml, body));
        }
        offset += line.len();
    }
    None
}

fn parse_frontmatter(path: &str, yaml: &str) -> Result<Mapping, ParseFailure> {
    let value: Value = serde_yaml::from_str(yaml)
        .map_err(|err| ParseFailure::new(path, format!("malformed frontmatter: {err}")))?;
    match value {
        Value::Mapping(map) => Ok(map),
        Value::Null => Ok(Mapping::new()),
        _ => Err(ParseFailure::new(
            path,
            "frontmatter is not a key/value mapping",
        )),
    }
}

fn field<'a>(map: &'a Mapping, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| map.get(*key))
}

fn field_string(map: &Mapping, keys: &[&str]) -> Option<String> {
    field(map, keys).and_then(scalar_string)
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Tagged(tagged) => scalar_string(&tagged.value),
        Value::Null | Value::Sequence(_) | Value::Mapping(_) => None,
    }
}

fn read_date(map: &Mapping, keys: &[&str], diagnostics: &mut Vec<String>) -> Option<DateTime<Utc>> {
    let raw = field_string(map, keys)?;
    if raw.is_empty() || raw.eq_ignore_ascii_case("n/a") {
        return None;
    }
    let parsed = parse_date(&raw);
    if parsed.is_none() {
        diagnostics.push(format!("unparseable {} date: {raw}", keys[0]));
    }
    parsed
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
    "%d %b %Y",
];

/// ISO-8601 first, then a handful of human-written layouts. Naive values are
/// taken as UTC.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(value) = DateTime::parse_from_rfc3339(raw) {
        return Some(value.with_timezone(&Utc));
    }
    let naive = raw
        .strip_suffix(" UTC")
        .or_else(|| raw.strip_suffix('Z'))
        .unwrap_or(raw)
        .trim();
    for format in DATETIME_FORMATS {
        if let Ok(value) = NaiveDateTime::parse_from_str(naive, format) {
            return Some(value.and_utc());
        }
    }
    for format in DATE_FORMATS {
        if let Ok(value) = NaiveDate::parse_from_str(naive, format) {
            return value.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }
    None
}

/// Splits a body on `## ` headings. Text before the first heading (usually the
/// `# ID: title` line) is not a section.
pub fn parse_sections(body: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;
    let mut in_fence = false;

    for line in body.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        if !in_fence {
            if let Some(heading) = line.strip_prefix("## ") {
                if let Some((heading, lines)) = current.take() {
                    sections.push(finish_section(heading, &lines));
                }
                current = Some((heading.trim().to_string(), Vec::new()));
                continue;
            }
        }
        if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        }
    }
    if let Some((heading, lines)) = current.take() {
        sections.push(finish_section(heading, &lines));
    }
    sections
}

fn finish_section(heading: String, lines: &[&str]) -> Section {
    Section {
        heading,
        content: lines.join("\n").trim_matches('\n').to_string(),
    }
}

fn detect_kind(
    frontmatter: &Mapping,
    names: &FileNames,
    declared_id: Option<&str>,
) -> Option<EntityKind> {
    if let Some(declared) = field_string(frontmatter, &["type", "kind"]) {
        let normalized = declared.to_lowercase().replace(['-', '_', ' '], "");
        match normalized.as_str() {
            "workeffort" => return Some(EntityKind::WorkEffort),
            "ticket" => return Some(EntityKind::Ticket),
            _ => {}
        }
    }
    if names.is_index() {
        return Some(EntityKind::WorkEffort);
    }
    if names.in_tickets_dir() {
        return Some(EntityKind::Ticket);
    }
    let candidate = declared_id.map(str::to_string).unwrap_or_else(|| names.stem.clone());
    if candidate.starts_with("WE-") {
        Some(EntityKind::WorkEffort)
    } else if candidate.starts_with("TKT-") {
        Some(EntityKind::Ticket)
    } else {
        None
    }
}

struct FileNames {
    stem: String,
    file_name: String,
    folders: Vec<String>,
}

impl FileNames {
    fn from_path(path: &str) -> Self {
        let as_path = Path::new(path);
        let file_name = as_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let stem = as_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();
        let folders = as_path
            .parent()
            .map(|parent| {
                parent
                    .components()
                    .map(|component| component.as_os_str().to_string_lossy().to_string())
                    .collect()
            })
            .unwrap_or_default();
        Self {
            stem,
            file_name,
            folders,
        }
    }

    fn is_index(&self) -> bool {
        self.file_name == "index.md" || self.stem.ends_with("_index")
    }

    fn in_tickets_dir(&self) -> bool {
        self.folders.last().map(String::as_str) == Some("tickets")
    }

    fn owning_folder(&self) -> Option<&str> {
        self.folders.last().map(String::as_str)
    }

    fn derived_id(&self, kind: EntityKind) -> Option<String> {
        let source = match kind {
            EntityKind::WorkEffort if self.file_name == "index.md" => self.owning_folder()?,
            _ => self.stem.as_str(),
        };
        let id = id_prefix(source);
        (!id.is_empty()).then(|| id.to_string())
    }

    fn derived_title(&self, kind: EntityKind, id: &str) -> Option<String> {
        let source = match kind {
            EntityKind::WorkEffort if self.is_index() => match self.owning_folder() {
                Some(folder) if folder.starts_with(id) => folder.to_string(),
                _ => self.stem.trim_end_matches("_index").to_string(),
            },
            _ => self.stem.clone(),
        };
        let rest = source
            .strip_prefix(id)
            .unwrap_or(&source)
            .trim_end_matches("_index")
            .replace(['_', '-'], " ");
        let title = rest.split_whitespace().collect::<Vec<_>>().join(" ");
        (!title.is_empty()).then_some(title)
    }

    fn parent_work_effort(&self) -> Option<String> {
        let tickets_idx = self.folders.iter().rposition(|folder| folder == "tickets")?;
        let folder = self.folders.get(tickets_idx.checked_sub(1)?)?;
        let id = id_prefix(folder);
        is_work_effort_id(id).then(|| id.to_string())
    }
}

fn id_prefix(name: &str) -> &str {
    name.split('_').next().unwrap_or(name)
}
