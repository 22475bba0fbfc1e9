use clap::Parser;
use serde::Deserialize;
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

pub const DEFAULT_ADDR: &str = "127.0.0.1:4870";
pub const DEFAULT_WORK_DIR: &str = "_work_efforts";
pub const DEFAULT_INCLUDE: [&str; 3] = ["**/*_index.md", "**/index.md", "**/tickets/*.md"];
pub const DEFAULT_DEBOUNCE_MS: u64 = 250;
pub const DEFAULT_MAX_WAIT_MS: u64 = 2000;
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "pyrite-hub", version, about = "Watches work-effort repositories and streams changes")]
pub struct Args {
    /// Listen address, falls back to PYRITE_HUB_ADDR then 127.0.0.1:4870
    #[arg(long, default_value = "")]
    pub addr: String,
    /// Repository to watch, as NAME=PATH (repeatable)
    #[arg(long = "repo", value_name = "NAME=PATH")]
    pub repos: Vec<String>,
    /// TOML file with [[repository]] tables
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub debounce_ms: Option<u64>,
    #[arg(long)]
    pub max_wait_ms: Option<u64>,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    /// Accept non-loopback connections
    #[arg(long, default_value_t = false)]
    pub allow_remote: bool,
    #[arg(long, default_value_t = 10)]
    pub ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    pub write_timeout: u64,
    #[arg(long, default_value_t = 60)]
    pub stale_seconds: u64,
    #[arg(long, default_value = "")]
    pub log_dir: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid repository '{0}', expected NAME=PATH")]
    InvalidRepository(String),
    #[error("repository '{0}' configured twice")]
    DuplicateRepository(String),
    #[error("cannot resolve current directory: {0}")]
    CurrentDir(#[source] std::io::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub addr: Option<String>,
    #[serde(default)]
    pub debounce_ms: Option<u64>,
    #[serde(default)]
    pub max_wait_ms: Option<u64>,
    #[serde(default)]
    pub work_dir: Option<String>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default, rename = "repository")]
    pub repositories: Vec<RepositoryConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RepositoryConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub work_dir: Option<String>,
    #[serde(default)]
    pub include: Vec<String>,
}

/// One watched repository, fully resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositorySpec {
    pub name: String,
    pub root: PathBuf,
    pub work_dir: String,
    pub include: Vec<String>,
}

impl RepositorySpec {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            work_dir: DEFAULT_WORK_DIR.to_string(),
            include: default_include(),
        }
    }

    /// The work directory when present, the repository root otherwise.
    pub fn scan_root(&self) -> PathBuf {
        let work_root = self.work_root();
        if work_root.is_dir() {
            work_root
        } else {
            self.root.clone()
        }
    }

    pub fn work_root(&self) -> PathBuf {
        if self.work_dir.trim().is_empty() {
            self.root.clone()
        } else {
            self.root.join(&self.work_dir)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSettings {
    pub debounce: Duration,
    pub max_wait: Duration,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            max_wait: Duration::from_millis(DEFAULT_MAX_WAIT_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: String,
    pub debug: bool,
    pub allow_remote: bool,
    pub repositories: Vec<RepositorySpec>,
    pub watch: WatchSettings,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub stale_after: Duration,
    pub queue_capacity: usize,
    pub log_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            debug: false,
            allow_remote: false,
            repositories: Vec::new(),
            watch: WatchSettings::default(),
            ping_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            stale_after: Duration::from_secs(60),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            log_dir: String::new(),
        }
    }
}

impl Config {
    /// Flags win over the config file, the file wins over PYRITE_* variables.
    pub fn resolve(args: Args) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => load_file(path)?,
            None => FileConfig::default(),
        };

        let addr = resolve_addr(&args.addr, file.addr.as_deref());
        let debounce_ms = args
            .debounce_ms
            .or(file.debounce_ms)
            .or_else(|| env_u64("PYRITE_DEBOUNCE_MS"))
            .unwrap_or(DEFAULT_DEBOUNCE_MS);
        let max_wait_ms = args
            .max_wait_ms
            .or(file.max_wait_ms)
            .or_else(|| env_u64("PYRITE_MAX_WAIT_MS"))
            .unwrap_or(DEFAULT_MAX_WAIT_MS)
            .max(debounce_ms);

        let mut repositories = Vec::new();
        let mut seen = HashSet::new();
        let config_dir = args
            .config
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        for entry in &file.repositories {
            let root = if entry.path.is_absolute() {
                entry.path.clone()
            } else {
                config_dir.join(&entry.path)
            };
            let spec = RepositorySpec {
                name: entry.name.clone(),
                root,
                work_dir: entry
                    .work_dir
                    .clone()
                    .or_else(|| file.work_dir.clone())
                    .unwrap_or_else(|| DEFAULT_WORK_DIR.to_string()),
                include: pick_include(&entry.include, &file.include),
            };
            push_unique(&mut repositories, &mut seen, spec)?;
        }
        for raw in &args.repos {
            let (name, path) = parse_repo_arg(raw)?;
            let mut spec = RepositorySpec::new(name, path);
            if let Some(work_dir) = &file.work_dir {
                spec.work_dir = work_dir.clone();
            }
            spec.include = pick_include(&[], &file.include);
            push_unique(&mut repositories, &mut seen, spec)?;
        }
        if repositories.is_empty() {
            let cwd = std::env::current_dir().map_err(ConfigError::CurrentDir)?;
            let name = cwd
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "default".to_string());
            let mut spec = RepositorySpec::new(name, cwd);
            if let Some(work_dir) = &file.work_dir {
                spec.work_dir = work_dir.clone();
            }
            spec.include = pick_include(&[], &file.include);
            repositories.push(spec);
        }

        Ok(Self {
            addr,
            debug: args.debug || env_true("PYRITE_HUB_DEBUG"),
            allow_remote: args.allow_remote || env_true("PYRITE_ALLOW_REMOTE"),
            repositories,
            watch: WatchSettings {
                debounce: Duration::from_millis(debounce_ms),
                max_wait: Duration::from_millis(max_wait_ms),
            },
            ping_interval: Duration::from_secs(args.ping_interval),
            write_timeout: Duration::from_secs(args.write_timeout.max(1)),
            stale_after: Duration::from_secs(args.stale_seconds),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            log_dir: resolve_log_dir(&args.log_dir),
        })
    }
}

pub fn default_include() -> Vec<String> {
    DEFAULT_INCLUDE.iter().map(|glob| glob.to_string()).collect()
}

pub fn parse_repo_arg(raw: &str) -> Result<(String, PathBuf), ConfigError> {
    let (name, path) = raw
        .split_once('=')
        .ok_or_else(|| ConfigError::InvalidRepository(raw.to_string()))?;
    let name = name.trim();
    let path = path.trim();
    if name.is_empty() || path.is_empty() {
        return Err(ConfigError::InvalidRepository(raw.to_string()));
    }
    Ok((name.to_string(), PathBuf::from(path)))
}

fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn pick_include(entry: &[String], shared: &[String]) -> Vec<String> {
    if !entry.is_empty() {
        entry.to_vec()
    } else if !shared.is_empty() {
        shared.to_vec()
    } else {
        default_include()
    }
}

fn push_unique(
    repositories: &mut Vec<RepositorySpec>,
    seen: &mut HashSet<String>,
    spec: RepositorySpec,
) -> Result<(), ConfigError> {
    if !seen.insert(spec.name.clone()) {
        return Err(ConfigError::DuplicateRepository(spec.name));
    }
    repositories.push(spec);
    Ok(())
}

fn resolve_addr(addr_flag: &str, file_addr: Option<&str>) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Some(value) = file_addr.filter(|value| !value.trim().is_empty()) {
        return value.to_string();
    }
    if let Ok(value) = std::env::var("PYRITE_HUB_ADDR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    DEFAULT_ADDR.to_string()
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    if let Ok(value) = std::env::var("PYRITE_LOG_DIR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    String::new()
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok()
}
