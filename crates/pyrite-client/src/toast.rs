//! User-facing notifications derived from bus events.

use crate::bus::{BusEvent, EventBus, SubscriptionId};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

pub const DEFAULT_TOAST_DURATION_MS: i64 = 5_000;
const SEEN_KEYS_LIMIT: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Toast {
    pub id: u64,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    /// `None` for toasts that stay until dismissed.
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct ToastManager {
    next_id: u64,
    duration: Duration,
    toasts: Vec<Toast>,
    seen: HashSet<String>,
    seen_order: VecDeque<String>,
}

impl Default for ToastManager {
    fn default() -> Self {
        Self::new(Duration::milliseconds(DEFAULT_TOAST_DURATION_MS))
    }
}

/// Severity and persistence for an event name, or `None` when it should not
/// toast at all.
pub fn classify(name: &str) -> Option<(Severity, bool)> {
    let (namespace, sub) = name.split_once(':').unwrap_or((name, ""));
    match namespace {
        "workeffort" | "ticket" => match sub {
            "completed" => Some((Severity::Success, false)),
            "created" | "active" | "in_progress" | "pending" | "removed" => {
                Some((Severity::Info, false))
            }
            "paused" => Some((Severity::Warning, false)),
            "blocked" => Some((Severity::Warning, true)),
            _ => None,
        },
        "diagnostic" if sub == "parse" => Some((Severity::Warning, false)),
        "diagnostic" => Some((Severity::Error, true)),
        "store" if sub == "desync" => Some((Severity::Error, true)),
        "hub" => Some((Severity::Error, true)),
        "repository" if sub == "added" || sub == "removed" => Some((Severity::Info, false)),
        _ => None,
    }
}

impl ToastManager {
    pub fn new(duration: Duration) -> Self {
        Self {
            next_id: 0,
            duration,
            toasts: Vec::new(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    pub fn attach(bus: &mut EventBus, manager: Arc<Mutex<Self>>) -> SubscriptionId {
        bus.subscribe("*", move |event: &BusEvent| {
            if let Ok(mut manager) = manager.lock() {
                manager.handle(event);
            }
        })
    }

    /// Raises a toast for `event`; returns its id, or `None` when the event
    /// does not toast or was already shown.
    pub fn handle(&mut self, event: &BusEvent) -> Option<u64> {
        let (severity, persistent) = classify(&event.name)?;
        if !self.remember(event.dedupe_key()) {
            return None;
        }
        self.next_id += 1;
        let created_at = event.at;
        let toast = Toast {
            id: self.next_id,
            severity,
            title: toast_title(event),
            message: toast_message(event),
            created_at,
            expires_at: (!persistent).then(|| created_at + self.duration),
        };
        tracing::debug!(event = "toast_raised", id = toast.id, severity = %severity, name = %event.name);
        self.toasts.push(toast);
        Some(self.next_id)
    }

    fn remember(&mut self, key: String) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.seen_order.len() == SEEN_KEYS_LIMIT {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.seen_order.push_back(key);
        true
    }

    pub fn active(&self) -> &[Toast] {
        &self.toasts
    }

    /// Drops auto-expiring toasts whose time is up and returns them.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<Toast> {
        let (expired, kept): (Vec<Toast>, Vec<Toast>) = std::mem::take(&mut self.toasts)
            .into_iter()
            .partition(|toast| toast.expires_at.is_some_and(|at| at <= now));
        self.toasts = kept;
        expired
    }

    pub fn dismiss(&mut self, id: u64) -> bool {
        let before = self.toasts.len();
        self.toasts.retain(|toast| toast.id != id);
        self.toasts.len() != before
    }
}

fn toast_title(event: &BusEvent) -> String {
    match (event.title(), event.id.as_deref()) {
        (Some(title), _) => title.to_string(),
        (None, Some(id)) => id.to_string(),
        (None, None) => event.repository.clone().unwrap_or_else(|| event.name.clone()),
    }
}

fn toast_message(event: &BusEvent) -> String {
    if let Some(message) = &event.message {
        return message.clone();
    }
    let label = match event.namespace() {
        "workeffort" => "Work effort",
        "ticket" => "Ticket",
        "repository" => "Repository",
        other => other,
    };
    let subject = event
        .id
        .as_deref()
        .or(event.repository.as_deref())
        .unwrap_or_default();
    format!("{label} {subject} {}", event.sub_type().replace('_', " "))
}
