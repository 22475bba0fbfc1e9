//! Synchronous publish/subscribe with `namespace:*` wildcards.
//!
//! Subscribers run on the publishing thread, in the order they registered,
//! regardless of whether they matched by exact name or by wildcard.

use chrono::{DateTime, Utc};
use pyrite_core::{ChangeAction, Entity, EntityKind};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEvent {
    /// `namespace:sub_type`, e.g. `ticket:completed`.
    pub name: String,
    pub repository: Option<String>,
    pub kind: Option<EntityKind>,
    pub id: Option<String>,
    pub action: Option<ChangeAction>,
    pub entity: Option<Entity>,
    pub previous_status: Option<String>,
    pub revision: u64,
    /// Bumped by the store each time a repository is (re)loaded wholesale, so
    /// revisions restarting from zero are not mistaken for repeats.
    pub epoch: u64,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

impl BusEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            repository: None,
            kind: None,
            id: None,
            action: None,
            entity: None,
            previous_status: None,
            revision: 0,
            epoch: 0,
            message: None,
            at: Utc::now(),
        }
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn namespace(&self) -> &str {
        self.name.split_once(':').map(|(ns, _)| ns).unwrap_or(&self.name)
    }

    pub fn sub_type(&self) -> &str {
        self.name.split_once(':').map(|(_, sub)| sub).unwrap_or("")
    }

    /// Identifies one logical occurrence; redelivery of the same update
    /// yields the same key. Events without an entity carry no revision, so
    /// their text and timestamp tell them apart.
    pub fn dedupe_key(&self) -> String {
        let repository = self.repository.as_deref().unwrap_or("");
        let id = self.id.as_deref().unwrap_or("");
        if self.kind.is_some() {
            return format!(
                "{}|{repository}|{id}|{}@{}",
                self.name, self.revision, self.epoch
            );
        }
        format!(
            "{}|{repository}|{id}|{}|{}",
            self.name,
            self.message.as_deref().unwrap_or(""),
            self.at.to_rfc3339()
        )
    }

    pub fn title(&self) -> Option<&str> {
        self.entity.as_ref().map(Entity::title)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Veto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub vetoed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub event: BusEvent,
    pub delivered: usize,
    pub vetoed: bool,
}

type Handler = Box<dyn FnMut(&BusEvent) + Send>;
type Middleware = Box<dyn FnMut(&BusEvent) -> Flow + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    All,
    Prefix(String),
}

impl Pattern {
    fn parse(pattern: &str) -> Option<Self> {
        if pattern == "*" {
            return Some(Pattern::All);
        }
        pattern
            .strip_suffix('*')
            .map(|prefix| Pattern::Prefix(prefix.to_string()))
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Pattern::All => true,
            Pattern::Prefix(prefix) => name.starts_with(prefix.as_str()),
        }
    }
}

struct Subscription {
    id: SubscriptionId,
    once: bool,
    handler: Handler,
}

enum Slot {
    Exact(usize),
    Wildcard(usize),
}

pub struct EventBus {
    next_id: u64,
    exact: HashMap<String, Vec<Subscription>>,
    wildcard: Vec<(Pattern, Subscription)>,
    middleware: Vec<Middleware>,
    history: VecDeque<HistoryEntry>,
    history_limit: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl EventBus {
    pub fn new(history_limit: usize) -> Self {
        Self {
            next_id: 0,
            exact: HashMap::new(),
            wildcard: Vec::new(),
            middleware: Vec::new(),
            history: VecDeque::new(),
            history_limit,
        }
    }

    pub fn subscribe<F>(&mut self, pattern: &str, handler: F) -> SubscriptionId
    where
        F: FnMut(&BusEvent) + Send + 'static,
    {
        self.register(pattern, false, Box::new(handler))
    }

    /// Like [`EventBus::subscribe`], removed after its first delivery.
    pub fn once<F>(&mut self, pattern: &str, handler: F) -> SubscriptionId
    where
        F: FnMut(&BusEvent) + Send + 'static,
    {
        self.register(pattern, true, Box::new(handler))
    }

    fn register(&mut self, pattern: &str, once: bool, handler: Handler) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        let subscription = Subscription { id, once, handler };
        match Pattern::parse(pattern) {
            Some(wildcard) => self.wildcard.push((wildcard, subscription)),
            None => self
                .exact
                .entry(pattern.to_string())
                .or_default()
                .push(subscription),
        }
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscription_count();
        for subscriptions in self.exact.values_mut() {
            subscriptions.retain(|subscription| subscription.id != id);
        }
        self.exact.retain(|_, subscriptions| !subscriptions.is_empty());
        self.wildcard.retain(|(_, subscription)| subscription.id != id);
        self.subscription_count() != before
    }

    pub fn use_middleware<F>(&mut self, middleware: F)
    where
        F: FnMut(&BusEvent) -> Flow + Send + 'static,
    {
        self.middleware.push(Box::new(middleware));
    }

    pub fn subscription_count(&self) -> usize {
        self.exact.values().map(Vec::len).sum::<usize>() + self.wildcard.len()
    }

    pub fn publish(&mut self, event: BusEvent) -> PublishReport {
        let vetoed = self
            .middleware
            .iter_mut()
            .any(|middleware| middleware(&event) == Flow::Veto);
        if vetoed {
            tracing::debug!(event = "bus_veto", name = %event.name);
            self.remember(event, 0, true);
            return PublishReport {
                delivered: 0,
                vetoed: true,
            };
        }

        let mut slots: Vec<(SubscriptionId, Slot)> = Vec::new();
        if let Some(subscriptions) = self.exact.get(&event.name) {
            slots.extend(
                subscriptions
                    .iter()
                    .enumerate()
                    .map(|(idx, subscription)| (subscription.id, Slot::Exact(idx))),
            );
        }
        slots.extend(
            self.wildcard
                .iter()
                .enumerate()
                .filter(|(_, (pattern, _))| pattern.matches(&event.name))
                .map(|(idx, (_, subscription))| (subscription.id, Slot::Wildcard(idx))),
        );
        slots.sort_by_key(|(id, _)| *id);

        let mut spent = Vec::new();
        for (_, slot) in &slots {
            let subscription = match slot {
                Slot::Exact(idx) => self
                    .exact
                    .get_mut(&event.name)
                    .and_then(|subscriptions| subscriptions.get_mut(*idx)),
                Slot::Wildcard(idx) => self
                    .wildcard
                    .get_mut(*idx)
                    .map(|(_, subscription)| subscription),
            };
            if let Some(subscription) = subscription {
                (subscription.handler)(&event);
                if subscription.once {
                    spent.push(subscription.id);
                }
            }
        }
        for id in spent {
            self.unsubscribe(id);
        }

        let delivered = slots.len();
        self.remember(event, delivered, false);
        PublishReport {
            delivered,
            vetoed: false,
        }
    }

    fn remember(&mut self, event: BusEvent, delivered: usize, vetoed: bool) {
        if self.history_limit == 0 {
            return;
        }
        if self.history.len() == self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(HistoryEntry {
            event,
            delivered,
            vetoed,
        });
    }

    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn FnMut(&BusEvent) + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let shared = log.clone();
        let make = move |label: &str| -> Box<dyn FnMut(&BusEvent) + Send> {
            let log = shared.clone();
            let label = label.to_string();
            Box::new(move |event: &BusEvent| {
                log.lock().unwrap().push(format!("{label}:{}", event.name));
            })
        };
        (log, make)
    }

    #[test]
    fn wildcard_and_exact_run_in_registration_order() {
        let (log, make) = recorder();
        let mut bus = EventBus::default();
        bus.subscribe("ticket:*", make("wild"));
        bus.subscribe("ticket:completed", make("exact"));
        bus.subscribe("*", make("all"));
        bus.subscribe("workeffort:*", make("we"));

        let report = bus.publish(BusEvent::new("ticket:completed"));
        assert_eq!(report.delivered, 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "wild:ticket:completed",
                "exact:ticket:completed",
                "all:ticket:completed"
            ]
        );

        log.lock().unwrap().clear();
        bus.publish(BusEvent::new("ticket:created"));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["wild:ticket:created", "all:ticket:created"]
        );
    }

    #[test]
    fn once_and_unsubscribe() {
        let (log, make) = recorder();
        let mut bus = EventBus::default();
        bus.once("store:synced", make("once"));
        let id = bus.subscribe("store:*", make("keep"));

        bus.publish(BusEvent::new("store:synced"));
        bus.publish(BusEvent::new("store:synced"));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "once:store:synced",
                "keep:store:synced",
                "keep:store:synced"
            ]
        );
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.publish(BusEvent::new("store:synced")).delivered, 0);
    }

    #[test]
    fn middleware_veto_stops_delivery_and_is_recorded() {
        let (log, make) = recorder();
        let mut bus = EventBus::default();
        bus.subscribe("*", make("all"));
        bus.use_middleware(|event| {
            if event.name.ends_with(":paused") {
                Flow::Veto
            } else {
                Flow::Continue
            }
        });

        let report = bus.publish(BusEvent::new("ticket:paused"));
        assert!(report.vetoed);
        assert!(log.lock().unwrap().is_empty());
        bus.publish(BusEvent::new("ticket:active"));

        let history: Vec<_> = bus.history().collect();
        assert_eq!(history.len(), 2);
        assert!(history[0].vetoed);
        assert_eq!(history[1].delivered, 1);
    }

    #[test]
    fn history_is_bounded() {
        let mut bus = EventBus::new(3);
        for idx in 0..5 {
            bus.publish(BusEvent::new(format!("ticket:n{idx}")));
        }
        let names: Vec<_> = bus.history().map(|entry| entry.event.name.clone()).collect();
        assert_eq!(names, vec!["ticket:n2", "ticket:n3", "ticket:n4"]);
        bus.clear_history();
        assert_eq!(bus.history().count(), 0);
    }

    #[test]
    fn event_name_parts() {
        let event = BusEvent::new("workeffort:completed");
        assert_eq!(event.namespace(), "workeffort");
        assert_eq!(event.sub_type(), "completed");
        assert_eq!(BusEvent::new("plain").sub_type(), "");
    }
}
