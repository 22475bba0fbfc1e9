//! Animation cues for entity changes. The renderer drains pending cues and
//! the controller forgets them once their duration has elapsed.

use crate::bus::{BusEvent, EventBus, SubscriptionId};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

const SEEN_KEYS_LIMIT: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cue {
    Celebrate,
    SlideIn,
    FadeOut,
    Shake,
    Pulse,
    Highlight,
}

impl Cue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cue::Celebrate => "celebrate",
            Cue::SlideIn => "slide-in",
            Cue::FadeOut => "fade-out",
            Cue::Shake => "shake",
            Cue::Pulse => "pulse",
            Cue::Highlight => "highlight",
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::milliseconds(match self {
            Cue::Celebrate => 1_500,
            Cue::Shake => 600,
            Cue::SlideIn | Cue::FadeOut => 400,
            Cue::Pulse | Cue::Highlight => 800,
        })
    }

    /// Cue for an entity event name; non-entity events have none.
    pub fn for_event(name: &str) -> Option<Cue> {
        let (namespace, sub) = name.split_once(':')?;
        if namespace != "workeffort" && namespace != "ticket" {
            return None;
        }
        Some(match sub {
            "completed" => Cue::Celebrate,
            "created" => Cue::SlideIn,
            "removed" => Cue::FadeOut,
            "blocked" => Cue::Shake,
            "updated" => Cue::Highlight,
            _ => Cue::Pulse,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Animation {
    pub cue: Cue,
    pub repository: Option<String>,
    pub target: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct AnimationController {
    pending: VecDeque<Animation>,
    running: Vec<Animation>,
    seen: HashSet<String>,
    seen_order: VecDeque<String>,
}

impl AnimationController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(bus: &mut EventBus, controller: Arc<Mutex<Self>>) -> SubscriptionId {
        bus.subscribe("*", move |event: &BusEvent| {
            if let Ok(mut controller) = controller.lock() {
                controller.handle(event);
            }
        })
    }

    pub fn handle(&mut self, event: &BusEvent) -> Option<Cue> {
        let cue = Cue::for_event(&event.name)?;
        let key = event.dedupe_key();
        if self.seen.contains(&key) {
            return None;
        }
        if self.seen_order.len() == SEEN_KEYS_LIMIT {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.seen_order.push_back(key);

        self.pending.push_back(Animation {
            cue,
            repository: event.repository.clone(),
            target: event.id.clone(),
            started_at: event.at,
            ends_at: event.at + cue.duration(),
        });
        Some(cue)
    }

    /// Hands pending cues to the renderer; they stay tracked as running.
    pub fn drain(&mut self) -> Vec<Animation> {
        let drained: Vec<Animation> = self.pending.drain(..).collect();
        self.running.extend(drained.iter().cloned());
        drained
    }

    pub fn running(&self) -> &[Animation] {
        &self.running
    }

    pub fn expire(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.running.len();
        self.running.retain(|animation| animation.ends_at > now);
        before - self.running.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cue_mapping() {
        assert_eq!(Cue::for_event("ticket:completed"), Some(Cue::Celebrate));
        assert_eq!(Cue::for_event("workeffort:created"), Some(Cue::SlideIn));
        assert_eq!(Cue::for_event("ticket:removed"), Some(Cue::FadeOut));
        assert_eq!(Cue::for_event("workeffort:blocked"), Some(Cue::Shake));
        assert_eq!(Cue::for_event("ticket:in_progress"), Some(Cue::Pulse));
        assert_eq!(Cue::for_event("workeffort:updated"), Some(Cue::Highlight));
        assert_eq!(Cue::for_event("store:synced"), None);
        assert_eq!(Cue::SlideIn.as_str(), "slide-in");
    }

    #[test]
    fn fires_once_per_key_then_expires() {
        let bus_controller = Arc::new(Mutex::new(AnimationController::new()));
        let mut bus = EventBus::default();
        AnimationController::attach(&mut bus, bus_controller.clone());

        let mut event = BusEvent::new("ticket:completed").with_repository("demo");
        event.kind = Some(pyrite_core::EntityKind::Ticket);
        event.id = Some("TKT-ab12-001".to_string());
        event.revision = 7;
        bus.publish(event.clone());
        bus.publish(event.clone());

        let mut controller = bus_controller.lock().unwrap();
        let drained = controller.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].cue, Cue::Celebrate);
        assert!(controller.drain().is_empty());
        assert_eq!(controller.running().len(), 1);

        assert_eq!(controller.expire(event.at + Duration::milliseconds(100)), 0);
        assert_eq!(controller.expire(event.at + Duration::seconds(2)), 1);
        assert!(controller.running().is_empty());
    }
}
