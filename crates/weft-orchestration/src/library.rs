//! Named workflow documents with a change feed.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{OrchResult, OrchestrationError};
use crate::workflow::WorkflowDocument;

/// Change to the set of known workflows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PatternUpdateEvent {
    Created {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<PathBuf>,
    },
    Modified {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<PathBuf>,
    },
    Deleted {
        name: String,
    },
    /// A document could not be loaded. The previous version, if any, stays.
    ValidationFailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<PathBuf>,
        error: String,
    },
}

/// Outcome of [`PatternLibrary::load_dir`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanReport {
    pub loaded: Vec<String>,
    pub failed: Vec<PathBuf>,
    pub removed: Vec<String>,
}

struct Entry {
    document: Arc<WorkflowDocument>,
    source: Option<PathBuf>,
}

pub struct PatternLibrary {
    entries: DashMap<String, Entry>,
    events: broadcast::Sender<PatternUpdateEvent>,
}

impl Default for PatternLibrary {
    fn default() -> Self {
        Self::new(64)
    }
}

impl PatternLibrary {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            entries: DashMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PatternUpdateEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: PatternUpdateEvent) {
        let _ = self.events.send(event);
    }

    /// Parse and store a document given as text.
    pub fn load_str(&self, text: &str) -> OrchResult<Arc<WorkflowDocument>> {
        self.accept(WorkflowDocument::from_yaml_str(text), None)
    }

    /// Parse and store a document file.
    pub async fn load_file(&self, path: impl AsRef<Path>) -> OrchResult<Arc<WorkflowDocument>> {
        let path = path.as_ref();
        let parsed = WorkflowDocument::from_file(path).await;
        self.accept(parsed, Some(path.to_path_buf()))
    }

    fn accept(
        &self,
        parsed: OrchResult<WorkflowDocument>,
        source: Option<PathBuf>,
    ) -> OrchResult<Arc<WorkflowDocument>> {
        let document = match parsed {
            Ok(document) => Arc::new(document),
            Err(e) => {
                warn!(source = ?source, error = %e, "Workflow document rejected");
                self.emit(PatternUpdateEvent::ValidationFailed {
                    source,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let name = document.name().to_string();
        let previous = self.entries.insert(
            name.clone(),
            Entry {
                document: Arc::clone(&document),
                source: source.clone(),
            },
        );
        match previous {
            None => {
                info!(workflow = %name, "Workflow added");
                self.emit(PatternUpdateEvent::Created { name, source });
            }
            Some(old) if *old.document != *document => {
                info!(workflow = %name, "Workflow updated");
                self.emit(PatternUpdateEvent::Modified { name, source });
            }
            Some(_) => debug!(workflow = %name, "Workflow unchanged"),
        }
        Ok(document)
    }

    /// Load every `*.yaml` and `*.yml` file in `dir`. Workflows previously
    /// loaded from that directory whose file is gone are removed. Failed
    /// files are reported, never fatal.
    pub async fn load_dir(&self, dir: impl AsRef<Path>) -> OrchResult<ScanReport> {
        let dir = dir.as_ref();
        if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
            return Err(OrchestrationError::FileNotFound(dir.display().to_string()));
        }

        let mut files = BTreeSet::new();
        for extension in ["yaml", "yml"] {
            let pattern = dir.join(format!("*.{extension}"));
            let paths = glob::glob(&pattern.to_string_lossy())
                .map_err(|e| OrchestrationError::InvalidWorkflow(e.to_string()))?;
            for path in paths {
                match path {
                    Ok(path) => {
                        files.insert(path);
                    }
                    Err(e) => warn!(error = %e, "Unreadable workflow path"),
                }
            }
        }

        let mut report = ScanReport::default();
        for path in &files {
            match self.load_file(path).await {
                Ok(document) => report.loaded.push(document.name().to_string()),
                Err(_) => report.failed.push(path.clone()),
            }
        }

        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|e| {
                e.source
                    .as_ref()
                    .is_some_and(|s| s.parent() == Some(dir) && !files.contains(s))
            })
            .map(|e| e.key().clone())
            .collect();
        for name in stale {
            if self.remove(&name).is_some() {
                report.removed.push(name);
            }
        }

        info!(
            dir = %dir.display(),
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            removed = report.removed.len(),
            "Workflow directory scanned"
        );
        Ok(report)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<WorkflowDocument>> {
        let (name, entry) = self.entries.remove(name)?;
        info!(workflow = %name, "Workflow removed");
        self.emit(PatternUpdateEvent::Deleted { name });
        Some(entry.document)
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkflowDocument>> {
        self.entries.get(name).map(|e| Arc::clone(&e.document))
    }

    /// Names of every stored workflow, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn pipeline(name: &str, prompt: &str) -> String {
        format!(
            "apiVersion: weft/v1\nkind: Workflow\nmetadata:\n  name: {name}\nspec:\n  type: pipeline\n  initial_prompt: {prompt}\n  stages:\n    - agent_id: writer\n"
        )
    }

    #[test]
    fn test_created_modified_deleted() {
        let library = PatternLibrary::default();
        let mut events = library.subscribe();

        library.load_str(&pipeline("essay", "draft")).unwrap();
        library.load_str(&pipeline("essay", "draft")).unwrap();
        library.load_str(&pipeline("essay", "rewrite")).unwrap();
        assert!(library.remove("essay").is_some());
        assert!(library.remove("essay").is_none());

        assert!(matches!(events.try_recv(), Ok(PatternUpdateEvent::Created { name, source: None }) if name == "essay"));
        assert!(matches!(events.try_recv(), Ok(PatternUpdateEvent::Modified { .. })));
        assert!(matches!(events.try_recv(), Ok(PatternUpdateEvent::Deleted { name }) if name == "essay"));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
        assert!(library.is_empty());
    }

    #[test]
    fn test_validation_failure_keeps_previous_version() {
        let library = PatternLibrary::default();
        library.load_str(&pipeline("essay", "draft")).unwrap();
        let mut events = library.subscribe();

        let err = library.load_str("apiVersion: weft/v1\nkind: Workflow\n").unwrap_err();
        assert!(err.is_configuration());
        assert!(matches!(events.try_recv(), Ok(PatternUpdateEvent::ValidationFailed { source: None, .. })));
        assert_eq!(library.list(), vec!["essay"]);
    }

    #[tokio::test]
    async fn test_load_dir_rescan() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.yaml"), pipeline("alpha", "x")).await.unwrap();
        tokio::fs::write(dir.path().join("b.yml"), pipeline("beta", "y")).await.unwrap();
        tokio::fs::write(dir.path().join("broken.yaml"), "kind: [").await.unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), "ignored").await.unwrap();

        let library = PatternLibrary::default();
        let report = library.load_dir(dir.path()).await.unwrap();
        assert_eq!(report.loaded, vec!["alpha", "beta"]);
        assert_eq!(report.failed, vec![dir.path().join("broken.yaml")]);
        assert_eq!(library.list(), vec!["alpha", "beta"]);

        tokio::fs::remove_file(dir.path().join("b.yml")).await.unwrap();
        let mut events = library.subscribe();
        let report = library.load_dir(dir.path()).await.unwrap();
        assert_eq!(report.removed, vec!["beta"]);
        assert_eq!(library.list(), vec!["alpha"]);

        let mut deleted = false;
        while let Ok(event) = events.try_recv() {
            deleted |= matches!(event, PatternUpdateEvent::Deleted { ref name } if name == "beta");
        }
        assert!(deleted);
    }

    #[tokio::test]
    async fn test_missing_dir() {
        let library = PatternLibrary::default();
        let err = library.load_dir("/nonexistent/weft/workflows").await.unwrap_err();
        assert_eq!(err.error_code(), "FILE_NOT_FOUND");
    }
}
