//! Client side of the work-effort sync pipeline: mirrors hub snapshots and
//! turns applied changes into bus events, toasts and animation cues.

pub mod animation;
pub mod bus;
pub mod connection;
pub mod store;
pub mod toast;

pub use animation::{Animation, AnimationController, Cue};
pub use bus::{BusEvent, EventBus, Flow, HistoryEntry, PublishReport, SubscriptionId};
pub use connection::{ConnectionConfig, ConnectionError};
pub use store::{ApplyOutcome, ClientStore, HUB_ERROR, REPOSITORY_ADDED};
pub use toast::{Severity, Toast, ToastManager};
