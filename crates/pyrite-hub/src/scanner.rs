use crate::config::RepositorySpec;
use globset::{Glob, GlobSet, GlobSetBuilder};
use pyrite_core::{parse_document, Diagnostic, DiagnosticKind, RepositorySnapshot, SnapshotBuilder};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("repository root {0} is not a readable directory")]
    MissingRoot(PathBuf),
    #[error("failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("invalid include pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
    #[error("scan task failed: {0}")]
    Join(String),
}

/// Compiled include globs, matched against repository-relative paths.
#[derive(Debug, Clone)]
pub struct IncludeSet {
    globs: GlobSet,
}

impl IncludeSet {
    pub fn new(patterns: &[String]) -> Result<Self, ScanError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|source| ScanError::Pattern {
                pattern: pattern.clone(),
                source,
            })?;
            builder.add(glob);
        }
        let globs = builder.build().map_err(|source| ScanError::Pattern {
            pattern: patterns.join(","),
            source,
        })?;
        Ok(Self { globs })
    }

    pub fn is_match(&self, relative: &str) -> bool {
        self.globs.is_match(relative)
    }
}

#[derive(Debug, Clone)]
pub struct ScanReport {
    pub snapshot: RepositorySnapshot,
    pub diagnostics: Vec<Diagnostic>,
    pub files: usize,
}

/// Reads every included file under the repository and builds a fresh
/// snapshot. Per-file trouble becomes a diagnostic; only an unreadable root
/// fails the whole scan.
pub async fn scan_repository(
    spec: &RepositorySpec,
    include: &IncludeSet,
) -> Result<ScanReport, ScanError> {
    match tokio::fs::metadata(&spec.root).await {
        Ok(meta) if meta.is_dir() => {}
        _ => return Err(ScanError::MissingRoot(spec.root.clone())),
    }

    let root = spec.root.clone();
    let scan_root = spec.scan_root();
    let walk_include = include.clone();
    let (files, walk_errors) =
        tokio::task::spawn_blocking(move || collect_files(&root, &scan_root, &walk_include))
            .await
            .map_err(|err| ScanError::Join(err.to_string()))??;

    let mut diagnostics: Vec<Diagnostic> = walk_errors
        .into_iter()
        .map(|(path, message)| {
            Diagnostic::new(&spec.name, DiagnosticKind::Scan, path, message)
        })
        .collect();

    let mut builder = SnapshotBuilder::new(&spec.name);
    for (path, relative) in &files {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(err) => {
                diagnostics.push(Diagnostic::new(
                    &spec.name,
                    DiagnosticKind::Scan,
                    Some(relative.clone()),
                    format!("read failed: {err}"),
                ));
                continue;
            }
        };
        match parse_document(relative, &content) {
            Ok(parsed) => {
                for note in parsed.diagnostics {
                    diagnostics.push(Diagnostic::new(
                        &spec.name,
                        DiagnosticKind::Parse,
                        Some(relative.clone()),
                        note,
                    ));
                }
                builder.insert(parsed.entity);
            }
            Err(failure) => {
                debug!(event = "parse_skip", repository = %spec.name, path = %relative, error = %failure.message);
                diagnostics.push(Diagnostic::new(
                    &spec.name,
                    DiagnosticKind::Parse,
                    Some(failure.path),
                    failure.message,
                ));
            }
        }
    }

    let (snapshot, notes) = builder.build();
    diagnostics.extend(notes.into_iter().map(|(path, message)| {
        Diagnostic::new(&spec.name, DiagnosticKind::Parse, Some(path), message)
    }));

    Ok(ScanReport {
        snapshot,
        diagnostics,
        files: files.len(),
    })
}

type WalkResult = (Vec<(PathBuf, String)>, Vec<(Option<String>, String)>);

fn collect_files(root: &Path, scan_root: &Path, include: &IncludeSet) -> Result<WalkResult, ScanError> {
    let mut files = Vec::new();
    let mut errors = Vec::new();
    for entry in WalkDir::new(scan_root).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => {
                return Err(ScanError::Walk {
                    path: scan_root.to_path_buf(),
                    source: err,
                })
            }
            Err(err) => {
                let path = err.path().and_then(|path| relative_path(root, path));
                errors.push((path, format!("walk failed: {err}")));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(relative) = relative_path(root, entry.path()) else {
            continue;
        };
        if include.is_match(&relative) {
            files.push((entry.into_path(), relative));
        }
    }
    Ok((files, errors))
}

/// `/`-separated path relative to the repository root.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_include;
    use pyrite_core::{TicketStatus, WorkStatus};

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, contents).expect("write");
    }

    fn include() -> IncludeSet {
        IncludeSet::new(&default_include()).expect("globs")
    }

    #[test]
    fn include_set_matches_default_layout() {
        let include = include();
        assert!(include.is_match("_work_efforts/WE-260101-ab12_parser/WE-260101-ab12_index.md"));
        assert!(include.is_match("_work_efforts/WE-260101-ab12_parser/tickets/TKT-ab12-001_x.md"));
        assert!(include.is_match("docs/index.md"));
        assert!(!include.is_match("_work_efforts/WE-260101-ab12_parser/notes.md"));
        assert!(matches!(
            IncludeSet::new(&["[".to_string()]),
            Err(ScanError::Pattern { .. })
        ));
    }

    #[tokio::test]
    async fn scan_builds_snapshot_and_reports_bad_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        write(
            root,
            "_work_efforts/WE-260101-ab12_parser/WE-260101-ab12_index.md",
            "---\nid: WE-260101-ab12\ntitle: Parser\nstatus: active\n---\n\n## Objective\nParse it\n",
        );
        write(
            root,
            "_work_efforts/WE-260101-ab12_parser/tickets/TKT-ab12-001_frontmatter.md",
            "---\nid: TKT-ab12-001\nparent: WE-260101-ab12\ntitle: Frontmatter\nstatus: in_progress\n---\n",
        );
        write(
            root,
            "_work_efforts/WE-260101-ab12_parser/tickets/TKT-ab12-002_broken.md",
            "no frontmatter here\n",
        );
        write(root, "README.md", "---\nid: WE-260101-zz99\n---\n");

        let spec = RepositorySpec::new("demo", root);
        let report = scan_repository(&spec, &include()).await.expect("scan");

        assert_eq!(report.files, 3);
        let we = &report.snapshot.work_efforts["WE-260101-ab12"];
        assert_eq!(we.status, WorkStatus::Active);
        assert_eq!(we.repository, "demo");
        assert_eq!(we.tickets, vec!["TKT-ab12-001".to_string()]);
        assert_eq!(
            report.snapshot.tickets["TKT-ab12-001"].status,
            TicketStatus::InProgress
        );
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics[0].kind, DiagnosticKind::Parse);
        assert_eq!(
            report.diagnostics[0].path.as_deref(),
            Some("_work_efforts/WE-260101-ab12_parser/tickets/TKT-ab12-002_broken.md")
        );
    }

    #[tokio::test]
    async fn missing_root_is_a_scan_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = RepositorySpec::new("gone", dir.path().join("missing"));
        let result = scan_repository(&spec, &include()).await;
        assert!(matches!(result, Err(ScanError::MissingRoot(_))));
    }

    #[test]
    fn relative_paths_use_forward_slashes() {
        let root = Path::new("/repo");
        assert_eq!(
            relative_path(root, Path::new("/repo/_work_efforts/a/b.md")).as_deref(),
            Some("_work_efforts/a/b.md")
        );
        assert_eq!(relative_path(root, Path::new("/repo")), None);
        assert_eq!(relative_path(root, Path::new("/elsewhere/x.md")), None);
    }
}
