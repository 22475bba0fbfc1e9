//! Hub side of the work-effort sync pipeline: watches repositories, keeps the
//! latest snapshot per repository and streams changes to WebSocket clients.

pub mod broadcast;
pub mod cache;
pub mod config;
pub mod control;
pub mod debounce;
pub mod logging;
pub mod registry;
pub mod scanner;
pub mod server;
pub mod watcher;

pub use broadcast::{Hub, HubConfig};
pub use cache::{CycleGate, StateCache};
pub use config::{Args, Config, RepositorySpec, WatchSettings};
pub use registry::{CycleOutcome, Registry, RegistryError};
pub use server::{router, AppState};
