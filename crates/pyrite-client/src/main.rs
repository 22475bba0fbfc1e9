use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use pyrite_client::{
    connection::{self, DEFAULT_HUB_URL},
    AnimationController, ClientStore, ConnectionConfig, EventBus, ToastManager,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pyrite-monitor", about = "Follow a pyrite hub and print toasts")]
struct Args {
    /// Hub WebSocket endpoint (falls back to PYRITE_HUB_URL).
    #[arg(long)]
    url: Option<String>,
    #[arg(long)]
    client_id: Option<String>,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else {
        std::env::var("PYRITE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let url = args
        .url
        .or_else(|| std::env::var("PYRITE_HUB_URL").ok())
        .unwrap_or_else(|| DEFAULT_HUB_URL.to_string());
    let client_id = args
        .client_id
        .unwrap_or_else(|| format!("pyrite-monitor-{}", std::process::id()));
    let config = ConnectionConfig::new(&url, client_id)?;

    let toasts = Arc::new(Mutex::new(ToastManager::default()));
    let animations = Arc::new(Mutex::new(AnimationController::new()));
    let mut bus = EventBus::default();
    ToastManager::attach(&mut bus, toasts.clone());
    AnimationController::attach(&mut bus, animations.clone());
    let store = Arc::new(Mutex::new(ClientStore::new(bus)));

    let mut conn = tokio::spawn(connection::run(config, store.clone()));
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let mut shown = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                render(&toasts, &animations, &mut shown);
            }
            joined = &mut conn => {
                match joined {
                    Ok(Err(err)) => warn!(event = "connection_failed", error = %err),
                    Err(err) => warn!(event = "connection_task_failed", error = %err),
                    Ok(Ok(())) => {}
                }
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!(event = "monitor_shutdown");
                conn.abort();
                break;
            }
        }
    }
    Ok(())
}

fn render(
    toasts: &Mutex<ToastManager>,
    animations: &Mutex<AnimationController>,
    shown: &mut u64,
) {
    let now = Utc::now();
    if let Ok(mut toasts) = toasts.lock() {
        for toast in toasts.active().iter() {
            if toast.id <= *shown {
                continue;
            }
            info!(event = "toast", id = toast.id, severity = %toast.severity, title = %toast.title, message = %toast.message);
            *shown = toast.id;
        }
        toasts.expire(now);
    }
    if let Ok(mut animations) = animations.lock() {
        for animation in animations.drain() {
            info!(
                event = "animation",
                cue = animation.cue.as_str(),
                repository = animation.repository.as_deref().unwrap_or(""),
                target = animation.target.as_deref().unwrap_or("")
            );
        }
        animations.expire(now);
    }
}
