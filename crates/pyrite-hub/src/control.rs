use crate::config::RepositorySpec;
use crate::registry::{RegistryError, RepositoryInfo};
use crate::server::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use pyrite_core::{
    is_frontmatter_close, is_frontmatter_open, Diagnostic, Entity, RepositorySnapshot,
    TicketStatus, WorkStatus,
};
use serde::{Deserialize, Serialize};
use std::{io, path::PathBuf, str::FromStr};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("repository '{0}' is not watched")]
    UnknownRepository(String),
    #[error("no work effort or ticket '{0}'")]
    UnknownEntity(String),
    #[error("invalid status '{0}'")]
    InvalidStatus(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0} has no frontmatter block")]
    NoFrontmatter(String),
    #[error("failed to update {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ControlError {
    fn status(&self) -> StatusCode {
        match self {
            ControlError::UnknownRepository(_) | ControlError::UnknownEntity(_) => {
                StatusCode::NOT_FOUND
            }
            ControlError::InvalidStatus(_) | ControlError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ControlError::Conflict(_) => StatusCode::CONFLICT,
            ControlError::NoFrontmatter(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ControlError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RegistryError> for ControlError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyWatched(_) => ControlError::Conflict(err.to_string()),
            RegistryError::NotWatched(name) => ControlError::UnknownRepository(name),
            RegistryError::InvalidName(_) | RegistryError::Scan(_) => {
                ControlError::BadRequest(err.to_string())
            }
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchRequest {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub work_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusRequest {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusChange {
    pub id: String,
    pub status: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiagnosticsQuery {
    #[serde(default)]
    pub repository: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/repositories",
            get(list_repositories).post(watch_repository),
        )
        .route(
            "/api/repositories/:name",
            get(get_repository).delete(unwatch_repository),
        )
        .route("/api/repositories/:name/status", put(set_status))
        .route("/api/diagnostics", get(list_diagnostics))
}

pub async fn list_repositories(State(state): State<AppState>) -> Json<Vec<RepositoryInfo>> {
    Json(state.registry.list().await)
}

pub async fn get_repository(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<RepositorySnapshot>, ControlError> {
    let snapshot = state
        .registry
        .cache()
        .get(&name)
        .await
        .ok_or(ControlError::UnknownRepository(name))?;
    Ok(Json(snapshot.as_ref().clone()))
}

pub async fn watch_repository(
    State(state): State<AppState>,
    Json(request): Json<WatchRequest>,
) -> Result<(StatusCode, Json<Vec<RepositoryInfo>>), ControlError> {
    match tokio::fs::metadata(&request.path).await {
        Ok(meta) if meta.is_dir() => {}
        _ => {
            return Err(ControlError::BadRequest(format!(
                "{} is not a directory",
                request.path.display()
            )))
        }
    }
    let mut spec = RepositorySpec::new(request.name, request.path);
    if let Some(work_dir) = request.work_dir {
        spec.work_dir = work_dir;
    }
    state.registry.watch(spec).await?;
    Ok((StatusCode::CREATED, Json(state.registry.list().await)))
}

pub async fn unwatch_repository(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ControlError> {
    state.registry.unwatch(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Rewrites the entity's `status` and `last_updated` frontmatter lines. The
/// new state reaches clients through the watcher like any other edit.
pub async fn set_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<StatusRequest>,
) -> Result<(StatusCode, Json<StatusChange>), ControlError> {
    let spec = state
        .registry
        .spec(&name)
        .await
        .ok_or_else(|| ControlError::UnknownRepository(name.clone()))?;
    let snapshot = state
        .registry
        .cache()
        .get(&name)
        .await
        .ok_or_else(|| ControlError::UnknownRepository(name.clone()))?;

    let entity = snapshot
        .work_efforts
        .get(&request.id)
        .cloned()
        .map(Entity::WorkEffort)
        .or_else(|| snapshot.tickets.get(&request.id).cloned().map(Entity::Ticket))
        .ok_or_else(|| ControlError::UnknownEntity(request.id.clone()))?;

    let status = canonical_status(&entity, &request.status)?;
    let path = spec.root.join(entity.path());
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|source| ControlError::Io {
            path: path.clone(),
            source,
        })?;
    let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let rewritten = rewrite_frontmatter(&content, &[("status", status), ("last_updated", stamp.as_str())])
        .ok_or_else(|| ControlError::NoFrontmatter(entity.path().to_string()))?;
    write_atomic(&path, &rewritten)
        .await
        .map_err(|source| ControlError::Io {
            path: path.clone(),
            source,
        })?;

    info!(event = "status_written", repository = %name, id = %request.id, status = status);
    Ok((
        StatusCode::ACCEPTED,
        Json(StatusChange {
            id: request.id,
            status: status.to_string(),
            path: entity.path().to_string(),
        }),
    ))
}

pub async fn list_diagnostics(
    State(state): State<AppState>,
    Query(query): Query<DiagnosticsQuery>,
) -> Json<Vec<Diagnostic>> {
    Json(
        state
            .registry
            .cache()
            .diagnostics(query.repository.as_deref())
            .await,
    )
}

fn canonical_status(entity: &Entity, raw: &str) -> Result<&'static str, ControlError> {
    let parsed = match entity {
        Entity::WorkEffort(_) => WorkStatus::from_str(raw).map(|status| status.as_str()),
        Entity::Ticket(_) => TicketStatus::from_str(raw).map(|status| status.as_str()),
    };
    parsed.map_err(|_| ControlError::InvalidStatus(raw.to_string()))
}

/// Replaces (or appends) top-level `key: value` lines inside the leading
/// frontmatter block, leaving every other byte untouched.
pub fn rewrite_frontmatter(content: &str, updates: &[(&str, &str)]) -> Option<String> {
    let newline = if content.contains("\r\n") { "\r\n" } else { "\n" };
    let mut lines: Vec<String> = content.split_inclusive('\n').map(str::to_string).collect();
    if !is_frontmatter_open(lines.first()?) {
        return None;
    }
    let mut close = lines
        .iter()
        .skip(1)
        .position(|line| is_frontmatter_close(line))?
        + 1;

    for (key, value) in updates {
        let prefix = format!("{key}:");
        let replacement = format!("{key}: {value}{newline}");
        match lines[1..close]
            .iter()
            .position(|line| line.starts_with(&prefix))
        {
            Some(idx) => lines[idx + 1] = replacement,
            None => {
                lines.insert(close, replacement);
                close += 1;
            }
        }
    }
    Some(lines.concat())
}

async fn write_atomic(path: &std::path::Path, payload: &str) -> io::Result<()> {
    let temp_path = match path.file_name() {
        Some(name) => path.with_file_name(format!(".{}.tmp", name.to_string_lossy())),
        None => path.with_extension("tmp"),
    };
    tokio::fs::write(&temp_path, payload).await?;
    tokio::fs::rename(&temp_path, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{Hub, HubConfig};
    use crate::cache::StateCache;
    use crate::config::WatchSettings;
    use crate::registry::Registry;
    use std::sync::Arc;

    const INDEX: &str = "_work_efforts/WE-260101-ab12_parser/WE-260101-ab12_index.md";
    const TICKET: &str = "_work_efforts/WE-260101-ab12_parser/tickets/TKT-ab12-001_frontmatter.md";

    #[test]
    fn rewrite_replaces_and_appends_keys() {
        let content = "---\nid: WE-1\nstatus: active\nstatus_note: keep\n---\n\n## Objective\nstatus: body\n";
        let rewritten = rewrite_frontmatter(
            content,
            &[("status", "completed"), ("last_updated", "2026-01-02T00:00:00Z")],
        )
        .expect("frontmatter");
        assert_eq!(
            rewritten,
            "---\nid: WE-1\nstatus: completed\nstatus_note: keep\nlast_updated: 2026-01-02T00:00:00Z\n---\n\n## Objective\nstatus: body\n"
        );
    }

    #[test]
    fn rewrite_keeps_crlf_and_rejects_plain_markdown() {
        let content = "---\r\nstatus: pending\r\n---\r\nbody\r\n";
        let rewritten = rewrite_frontmatter(content, &[("status", "blocked")]).expect("frontmatter");
        assert_eq!(rewritten, "---\r\nstatus: blocked\r\n---\r\nbody\r\n");
        assert!(rewrite_frontmatter("# Title\n", &[("status", "x")]).is_none());
        assert!(rewrite_frontmatter("---\nstatus: open\n", &[("status", "x")]).is_none());
    }

    #[test]
    fn rewritten_document_end_fence_still_parses() {
        let content = "---\nid: TKT-ab12-001\nstatus: pending\n...\nBody\n";
        let rewritten = rewrite_frontmatter(content, &[("status", "completed")]).expect("frontmatter");
        assert_eq!(rewritten, "---\nid: TKT-ab12-001\nstatus: completed\n...\nBody\n");
        let parsed = pyrite_core::parse_document(TICKET, &rewritten).expect("parse");
        assert_eq!(parsed.entity.status_str(), "completed");
    }

    async fn state_with_repo(root: &std::path::Path) -> AppState {
        for (path, contents) in [
            (INDEX, "---\nid: WE-260101-ab12\ntitle: Parser\nstatus: active\n---\n"),
            (
                TICKET,
                "---\nid: TKT-ab12-001\nparent: WE-260101-ab12\ntitle: Frontmatter\nstatus: pending\n---\nBody\n",
            ),
        ] {
            let path = root.join(path);
            std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
            std::fs::write(path, contents).expect("write");
        }
        let hub = Arc::new(Hub::new(HubConfig::default(), Arc::new(StateCache::new())));
        let registry = Registry::new(hub.clone(), WatchSettings::default());
        registry
            .track(RepositorySpec::new("demo", root))
            .await
            .expect("track");
        AppState {
            registry,
            hub,
            allow_remote: false,
        }
    }

    #[tokio::test]
    async fn set_status_rewrites_ticket_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state_with_repo(dir.path()).await;

        let (code, Json(change)) = set_status(
            State(state.clone()),
            Path("demo".to_string()),
            Json(StatusRequest {
                id: "TKT-ab12-001".to_string(),
                status: "in-progress".to_string(),
            }),
        )
        .await
        .expect("status change");

        assert_eq!(code, StatusCode::ACCEPTED);
        assert_eq!(change.status, "in_progress");
        let written = std::fs::read_to_string(dir.path().join(TICKET)).expect("read");
        assert!(written.contains("status: in_progress\n"));
        assert!(written.contains("last_updated: "));
        assert!(written.ends_with("---\nBody\n"));

        state.registry.trigger("demo").await;
        let snapshot = state.registry.cache().get("demo").await.expect("snapshot");
        assert_eq!(
            snapshot.tickets["TKT-ab12-001"].status,
            TicketStatus::InProgress
        );
    }

    #[tokio::test]
    async fn set_status_error_codes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state_with_repo(dir.path()).await;

        let missing_repo = set_status(
            State(state.clone()),
            Path("nope".to_string()),
            Json(StatusRequest {
                id: "TKT-ab12-001".to_string(),
                status: "completed".to_string(),
            }),
        )
        .await
        .expect_err("unknown repo");
        assert_eq!(missing_repo.status(), StatusCode::NOT_FOUND);

        let missing_entity = set_status(
            State(state.clone()),
            Path("demo".to_string()),
            Json(StatusRequest {
                id: "TKT-ab12-999".to_string(),
                status: "completed".to_string(),
            }),
        )
        .await
        .expect_err("unknown entity");
        assert_eq!(missing_entity.status(), StatusCode::NOT_FOUND);

        let invalid = set_status(
            State(state),
            Path("demo".to_string()),
            Json(StatusRequest {
                id: "WE-260101-ab12".to_string(),
                status: "sideways".to_string(),
            }),
        )
        .await
        .expect_err("invalid status");
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn listing_and_unwatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state_with_repo(dir.path()).await;

        let Json(infos) = list_repositories(State(state.clone())).await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].revision, 1);
        assert_eq!(infos[0].stats.tickets, 1);

        let Json(snapshot) = get_repository(State(state.clone()), Path("demo".to_string()))
            .await
            .expect("snapshot");
        assert_eq!(snapshot.work_efforts.len(), 1);

        let code = unwatch_repository(State(state.clone()), Path("demo".to_string()))
            .await
            .expect("unwatch");
        assert_eq!(code, StatusCode::NO_CONTENT);
        let err = unwatch_repository(State(state), Path("demo".to_string()))
            .await
            .expect_err("already gone");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
