//! Filesystem service: keeps the in-memory file tree synchronized with the
//! sandbox filesystem and notifies observers of changes.
//!
//! The sandbox is always authoritative: content reads go straight to it, and
//! a background reconciliation poll repairs drift caused by out-of-band
//! writes (e.g. a dev server emitting build artifacts). The cached tree is
//! only ever handed out as deep copies so consumers cannot mutate it behind
//! the service's back.

pub mod tree;

use std::sync::Arc;

use async_recursion::async_recursion;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::runtime::sandbox::{Sandbox, SandboxError};
use crate::runtime::{RuntimeError, RuntimeManager};
use tree::FileSystemNode;

/// Directory names excluded from full-tree reads, alongside hidden entries.
const SKIPPED_DIRS: &[&str] = &["node_modules"];

#[derive(Debug, Error)]
pub enum FsError {
    #[error("sandbox runtime not initialized")]
    RuntimeUnavailable,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("folder rename is not implemented")]
    FolderRenameNotImplemented,

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

impl From<RuntimeError> for FsError {
    fn from(_: RuntimeError) -> Self {
        FsError::RuntimeUnavailable
    }
}

/// One atomic file-change intent; a batch of these is the unit the
/// application pipeline submits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FileOperation {
    Create { path: String, content: String },
    Update { path: String, content: String },
    Delete { path: String },
    Rename { path: String, new_path: String },
}

impl FileOperation {
    pub fn path(&self) -> &str {
        match self {
            FileOperation::Create { path, .. }
            | FileOperation::Update { path, .. }
            | FileOperation::Delete { path }
            | FileOperation::Rename { path, .. } => path,
        }
    }
}

/// Result of one operation within a batch.
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    pub operation: FileOperation,
    pub error: Option<String>,
}

impl OperationOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Typed change notifications for tree observers.
#[derive(Debug, Clone)]
pub enum FsEvent {
    /// A single file was created, updated, deleted, or renamed.
    FileChanged { path: String },
    /// The tree changed; carries a deep copy of the new tree.
    TreeUpdated { tree: FileSystemNode },
    /// A batch finished applying (fires even when some operations failed).
    OperationsApplied { applied: usize, failed: usize },
}

struct FsInner {
    runtime: RuntimeManager,
    tree: RwLock<FileSystemNode>,
    events: broadcast::Sender<FsEvent>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

/// Service owning the virtual file tree. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct FileSystemService {
    inner: Arc<FsInner>,
}

impl FileSystemService {
    pub fn new(runtime: RuntimeManager) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(FsInner {
                runtime,
                tree: RwLock::new(FileSystemNode::root()),
                events,
                reconciler: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FsEvent> {
        self.inner.events.subscribe()
    }

    /// Deep-copy snapshot of the current tree. May lag the sandbox by up to
    /// one reconciliation interval; use [`read_file`](Self::read_file) for
    /// authoritative content.
    pub async fn tree(&self) -> FileSystemNode {
        self.inner.tree.read().await.clone()
    }

    async fn sandbox(&self) -> Result<Arc<dyn Sandbox>, FsError> {
        Ok(self.inner.runtime.sandbox().await?)
    }

    fn notify(&self, event: FsEvent) {
        let _ = self.inner.events.send(event);
    }

    async fn notify_tree_updated(&self) {
        let tree = self.inner.tree.read().await.clone();
        self.notify(FsEvent::TreeUpdated { tree });
    }

    /// Mount a starter template: clone it into memory and replay it into the
    /// sandbox (folders first, then file writes).
    pub async fn initialize(&self, template: FileSystemNode) -> Result<(), FsError> {
        let sandbox = self.sandbox().await?;
        let (dirs, files) = template.mount_plan();
        for dir in dirs {
            sandbox.mkdir(&dir).await?;
        }
        for (path, content) in files {
            sandbox.write_file(&path, &content).await?;
        }
        *self.inner.tree.write().await = template;
        tracing::info!("filesystem initialized from template");
        self.notify_tree_updated().await;
        Ok(())
    }

    /// Adopt the sandbox's current filesystem as the in-memory tree instead
    /// of mounting a template. Hidden entries and dependency-install
    /// directories are skipped.
    pub async fn initialize_empty(&self) -> Result<(), FsError> {
        let sandbox = self.sandbox().await?;
        let tree = read_folder(&sandbox, "", "root").await?;
        let files = tree.file_count();
        *self.inner.tree.write().await = tree;
        tracing::info!(files, "filesystem adopted from sandbox");
        self.notify_tree_updated().await;
        Ok(())
    }

    /// Create (or overwrite) a file, ensuring every intermediate directory
    /// exists first.
    pub async fn create_file(&self, path: &str, content: &str) -> Result<(), FsError> {
        self.create_file_inner(path, content, true).await
    }

    async fn create_file_inner(
        &self,
        path: &str,
        content: &str,
        notify: bool,
    ) -> Result<(), FsError> {
        let sandbox = self.sandbox().await?;
        validate_path(path)?;

        // Create each parent segment idempotently; "already exists" is fine.
        for prefix in parent_prefixes(path) {
            sandbox.mkdir(&prefix).await?;
        }
        sandbox.write_file(path, content).await?;

        self.inner.tree.write().await.insert_file(path, content);
        tracing::debug!(path = %path, bytes = content.len(), "file created");
        if notify {
            self.notify(FsEvent::FileChanged {
                path: path.to_string(),
            });
            self.notify_tree_updated().await;
        }
        Ok(())
    }

    /// Read file content live from the sandbox (authoritative, never the
    /// cached tree).
    pub async fn read_file(&self, path: &str) -> Result<String, FsError> {
        let sandbox = self.sandbox().await?;
        Ok(sandbox.read_file(path).await?)
    }

    /// Write to the sandbox, then refresh the cached node if present.
    pub async fn update_file(&self, path: &str, content: &str) -> Result<(), FsError> {
        self.update_file_inner(path, content, true).await
    }

    async fn update_file_inner(
        &self,
        path: &str,
        content: &str,
        notify: bool,
    ) -> Result<(), FsError> {
        let sandbox = self.sandbox().await?;
        validate_path(path)?;
        sandbox.write_file(path, content).await?;
        self.inner.tree.write().await.update_content(path, content);
        if notify {
            self.notify(FsEvent::FileChanged {
                path: path.to_string(),
            });
            self.notify_tree_updated().await;
        }
        Ok(())
    }

    /// Delete a file, or a folder recursively.
    pub async fn delete(&self, path: &str) -> Result<(), FsError> {
        self.delete_inner(path, true).await
    }

    async fn delete_inner(&self, path: &str, notify: bool) -> Result<(), FsError> {
        let sandbox = self.sandbox().await?;
        validate_path(path)?;
        let recursive = self
            .inner
            .tree
            .read()
            .await
            .find(path)
            .map(|node| node.is_folder())
            .unwrap_or(false);
        sandbox.remove(path, recursive).await?;
        self.inner.tree.write().await.remove(path);
        tracing::debug!(path = %path, recursive, "deleted");
        if notify {
            self.notify(FsEvent::FileChanged {
                path: path.to_string(),
            });
            self.notify_tree_updated().await;
        }
        Ok(())
    }

    /// Rename a file by create-at-new-path + delete-old. Folder rename is an
    /// explicit gap and fails with [`FsError::FolderRenameNotImplemented`].
    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), FsError> {
        self.rename_inner(old_path, new_path, true).await
    }

    async fn rename_inner(
        &self,
        old_path: &str,
        new_path: &str,
        notify: bool,
    ) -> Result<(), FsError> {
        validate_path(old_path)?;
        validate_path(new_path)?;
        if self
            .inner
            .tree
            .read()
            .await
            .find(old_path)
            .map(|node| node.is_folder())
            .unwrap_or(false)
        {
            return Err(FsError::FolderRenameNotImplemented);
        }
        let content = self.read_file(old_path).await?;
        self.create_file_inner(new_path, &content, false).await?;
        self.delete_inner(old_path, false).await?;
        if notify {
            self.notify(FsEvent::FileChanged {
                path: new_path.to_string(),
            });
            self.notify_tree_updated().await;
        }
        Ok(())
    }

    /// Create a directory chain and record an empty folder node.
    pub async fn create_directory(&self, path: &str) -> Result<(), FsError> {
        let sandbox = self.sandbox().await?;
        validate_path(path)?;
        for prefix in parent_prefixes(path) {
            sandbox.mkdir(&prefix).await?;
        }
        sandbox.mkdir(path).await?;
        self.inner.tree.write().await.insert_folder(path);
        self.notify_tree_updated().await;
        Ok(())
    }

    /// Deep copy of the node at `path`, or `None` (never an error).
    pub async fn find_node(&self, path: &str) -> Option<FileSystemNode> {
        self.inner.tree.read().await.find(path).cloned()
    }

    /// Case-insensitive substring search over cached file names and contents.
    pub async fn search_files(&self, query: &str) -> Vec<FileSystemNode> {
        self.inner.tree.read().await.search(query)
    }

    /// Apply a batch of operations sequentially, in order.
    ///
    /// Per-operation failures are caught, logged, and absorbed — a partially
    /// failed AI generation must not lose the files that did apply. Per-item
    /// notifications are suppressed for the whole batch; one aggregate
    /// `OperationsApplied` + `TreeUpdated` pair fires at the end regardless
    /// of individual failures.
    ///
    /// Errors only when the runtime itself is unavailable.
    pub async fn apply_operations(
        &self,
        operations: &[FileOperation],
    ) -> Result<Vec<OperationOutcome>, FsError> {
        // Fail the whole submission only when the sandbox is not there at all.
        self.sandbox().await?;

        let mut outcomes = Vec::with_capacity(operations.len());
        for operation in operations {
            let result = match operation {
                FileOperation::Create { path, content } => {
                    self.create_file_inner(path, content, false).await
                }
                FileOperation::Update { path, content } => {
                    self.update_file_inner(path, content, false).await
                }
                FileOperation::Delete { path } => self.delete_inner(path, false).await,
                FileOperation::Rename { path, new_path } => {
                    self.rename_inner(path, new_path, false).await
                }
            };
            let error = result.err().map(|e| {
                tracing::warn!(
                    path = %operation.path(),
                    error = %e,
                    "file operation failed; continuing batch"
                );
                e.to_string()
            });
            outcomes.push(OperationOutcome {
                operation: operation.clone(),
                error,
            });
        }

        let applied = outcomes.iter().filter(|o| o.succeeded()).count();
        let failed = outcomes.len() - applied;
        tracing::info!(applied, failed, "operation batch applied");
        self.notify(FsEvent::OperationsApplied { applied, failed });
        self.notify_tree_updated().await;
        Ok(outcomes)
    }

    /// Start the background reconciliation poll: re-read the sandbox tree on
    /// an interval and replace the cache (with a notification) only when it
    /// differs. Restarts the previous poller if one was running.
    pub async fn start_reconciler(&self, interval: Duration) {
        let service = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval fires immediately; skip that first tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = service.reconcile().await {
                    tracing::debug!(error = %e, "reconciliation skipped");
                }
            }
        });
        if let Some(previous) = self.inner.reconciler.lock().await.replace(handle) {
            previous.abort();
        }
    }

    pub async fn stop_reconciler(&self) {
        if let Some(handle) = self.inner.reconciler.lock().await.take() {
            handle.abort();
        }
    }

    /// One reconciliation pass. Public so callers can force a sync.
    pub async fn reconcile(&self) -> Result<bool, FsError> {
        let sandbox = self.sandbox().await?;
        let fresh = read_folder(&sandbox, "", "root").await?;
        let changed = {
            let mut tree = self.inner.tree.write().await;
            if *tree == fresh {
                false
            } else {
                *tree = fresh;
                true
            }
        };
        if changed {
            tracing::debug!("reconciliation found drift; cache replaced");
            self.notify_tree_updated().await;
        }
        Ok(changed)
    }
}

fn validate_path(path: &str) -> Result<(), FsError> {
    if path.is_empty() || path.starts_with('/') || path.ends_with('/') {
        return Err(FsError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// All strict parent prefixes of `path`, shortest first:
/// `"a/b/c.txt"` → `["a", "a/b"]`.
fn parent_prefixes(path: &str) -> Vec<String> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut prefixes = Vec::new();
    let mut prefix = String::new();
    for segment in segments.iter().take(segments.len().saturating_sub(1)) {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(segment);
        prefixes.push(prefix.clone());
    }
    prefixes
}

/// Recursively read a sandbox directory into a folder node, skipping hidden
/// entries and dependency-install directories. Entries are sorted by name so
/// repeated reads compare stably.
#[async_recursion]
async fn read_folder(
    sandbox: &Arc<dyn Sandbox>,
    path: &str,
    name: &str,
) -> Result<FileSystemNode, FsError> {
    let mut entries = sandbox.read_dir(path).await?;
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let mut children = Vec::new();
    for entry in entries {
        if entry.name.starts_with('.') || SKIPPED_DIRS.contains(&entry.name.as_str()) {
            continue;
        }
        let child_path = if path.is_empty() {
            entry.name.clone()
        } else {
            format!("{}/{}", path, entry.name)
        };
        if entry.is_dir {
            children.push(read_folder(sandbox, &child_path, &entry.name).await?);
        } else {
            let content = sandbox.read_file(&child_path).await?;
            children.push(FileSystemNode::file(&entry.name, &child_path, content));
        }
    }
    Ok(FileSystemNode::folder(name, path, children))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::sandbox::LocalProvider;

    async fn booted_service() -> (tempfile::TempDir, FileSystemService) {
        let dir = tempfile::tempdir().unwrap();
        let runtime = RuntimeManager::new(Box::new(LocalProvider::new(dir.path().to_path_buf())));
        runtime.boot().await.unwrap();
        (dir, FileSystemService::new(runtime))
    }

    #[tokio::test]
    async fn test_operations_require_booted_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = RuntimeManager::new(Box::new(LocalProvider::new(dir.path().to_path_buf())));
        let service = FileSystemService::new(runtime);
        assert!(matches!(
            service.create_file("a.txt", "x").await,
            Err(FsError::RuntimeUnavailable)
        ));
        assert!(matches!(
            service.apply_operations(&[]).await,
            Err(FsError::RuntimeUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_create_file_builds_directories_and_tree() {
        let (_dir, service) = booted_service().await;
        service
            .create_file("app/routes/index.tsx", "export default null")
            .await
            .unwrap();

        // live read from the sandbox
        assert_eq!(
            service.read_file("app/routes/index.tsx").await.unwrap(),
            "export default null"
        );
        // cached tree has the node with full paths
        let node = service.find_node("app/routes/index.tsx").await.unwrap();
        assert_eq!(node.path(), "app/routes/index.tsx");
        assert!(service.find_node("app/routes").await.unwrap().is_folder());
    }

    #[tokio::test]
    async fn test_create_then_delete_leaves_nothing() {
        let (_dir, service) = booted_service().await;
        service.create_file("a/b/c.txt", "x").await.unwrap();
        service.delete("a/b/c.txt").await.unwrap();
        service.create_file("a/b/c.txt", "x").await.unwrap();
        service.delete("a/b/c.txt").await.unwrap();

        assert!(service.find_node("a/b/c.txt").await.is_none());
        assert!(matches!(
            service.read_file("a/b/c.txt").await,
            Err(FsError::Sandbox(SandboxError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_delete_folder_is_recursive() {
        let (_dir, service) = booted_service().await;
        service.create_file("pkg/src/lib.rs", "x").await.unwrap();
        service.create_file("pkg/Cargo.toml", "y").await.unwrap();
        service.delete("pkg").await.unwrap();
        assert!(service.find_node("pkg").await.is_none());
        assert!(service.read_file("pkg/Cargo.toml").await.is_err());
    }

    #[tokio::test]
    async fn test_rename_file_moves_content() {
        let (_dir, service) = booted_service().await;
        service.create_file("old.txt", "content").await.unwrap();
        service.rename("old.txt", "docs/new.txt").await.unwrap();
        assert_eq!(service.read_file("docs/new.txt").await.unwrap(), "content");
        assert!(service.find_node("old.txt").await.is_none());
    }

    #[tokio::test]
    async fn test_rename_folder_not_implemented() {
        let (_dir, service) = booted_service().await;
        service.create_directory("some/dir").await.unwrap();
        assert!(matches!(
            service.rename("some", "other").await,
            Err(FsError::FolderRenameNotImplemented)
        ));
    }

    #[tokio::test]
    async fn test_apply_operations_is_idempotent_for_create() {
        let (_dir, service) = booted_service().await;
        let op = FileOperation::Create {
            path: "src/main.ts".to_string(),
            content: "console.log(1)".to_string(),
        };
        service.apply_operations(&[op.clone()]).await.unwrap();
        service.apply_operations(&[op]).await.unwrap();
        assert_eq!(
            service.read_file("src/main.ts").await.unwrap(),
            "console.log(1)"
        );
        assert_eq!(service.tree().await.file_count(), 1);
    }

    #[tokio::test]
    async fn test_apply_operations_absorbs_individual_failures() {
        let (_dir, service) = booted_service().await;
        let operations = vec![
            FileOperation::Create {
                path: "ok-one.txt".to_string(),
                content: "1".to_string(),
            },
            FileOperation::Delete {
                path: "does-not-exist.txt".to_string(),
            },
            FileOperation::Create {
                path: "ok-two.txt".to_string(),
                content: "2".to_string(),
            },
        ];
        let outcomes = service.apply_operations(&operations).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].succeeded());
        assert!(!outcomes[1].succeeded());
        assert!(outcomes[2].succeeded());
        // siblings of the failed op still applied
        assert_eq!(service.read_file("ok-two.txt").await.unwrap(), "2");
    }

    #[tokio::test]
    async fn test_apply_operations_handles_every_variant() {
        let (_dir, service) = booted_service().await;
        service.create_file("app.js", "v1").await.unwrap();
        let operations = vec![
            FileOperation::Update {
                path: "app.js".to_string(),
                content: "v2".to_string(),
            },
            FileOperation::Rename {
                path: "app.js".to_string(),
                new_path: "main.js".to_string(),
            },
            FileOperation::Create {
                path: "extra.txt".to_string(),
                content: "x".to_string(),
            },
            FileOperation::Delete {
                path: "extra.txt".to_string(),
            },
        ];
        let outcomes = service.apply_operations(&operations).await.unwrap();
        assert!(outcomes.iter().all(|o| o.succeeded()));
        assert_eq!(service.read_file("main.js").await.unwrap(), "v2");
        assert!(service.find_node("app.js").await.is_none());
        assert!(service.find_node("extra.txt").await.is_none());
    }

    #[tokio::test]
    async fn test_apply_operations_suppresses_per_item_events() {
        let (_dir, service) = booted_service().await;
        let mut events = service.subscribe();
        service
            .apply_operations(&[
                FileOperation::Create {
                    path: "a.txt".to_string(),
                    content: "a".to_string(),
                },
                FileOperation::Create {
                    path: "b.txt".to_string(),
                    content: "b".to_string(),
                },
            ])
            .await
            .unwrap();

        // exactly one aggregate pair, no per-file notifications
        match events.try_recv().unwrap() {
            FsEvent::OperationsApplied { applied, failed } => {
                assert_eq!(applied, 2);
                assert_eq!(failed, 0);
            }
            other => panic!("expected OperationsApplied, got {:?}", other),
        }
        assert!(matches!(
            events.try_recv().unwrap(),
            FsEvent::TreeUpdated { .. }
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_initialize_mounts_template() {
        let (_dir, service) = booted_service().await;
        let mut template = FileSystemNode::root();
        template.insert_file("package.json", "{}");
        template.insert_file("src/index.js", "export {}");
        service.initialize(template).await.unwrap();

        assert_eq!(service.read_file("package.json").await.unwrap(), "{}");
        assert_eq!(service.read_file("src/index.js").await.unwrap(), "export {}");
        assert!(service.find_node("src/index.js").await.is_some());
    }

    #[tokio::test]
    async fn test_initialize_empty_adopts_sandbox_state() {
        let (_dir, service) = booted_service().await;
        let sandbox = service.inner.runtime.sandbox().await.unwrap();
        sandbox.mkdir("existing").await.unwrap();
        sandbox.write_file("existing/file.txt", "hi").await.unwrap();
        sandbox.mkdir(".git").await.unwrap();
        sandbox.mkdir("node_modules").await.unwrap();

        service.initialize_empty().await.unwrap();
        assert!(service.find_node("existing/file.txt").await.is_some());
        // hidden and dependency directories are not adopted
        assert!(service.find_node(".git").await.is_none());
        assert!(service.find_node("node_modules").await.is_none());
    }

    #[tokio::test]
    async fn test_reconcile_detects_out_of_band_changes() {
        let (_dir, service) = booted_service().await;
        service.initialize_empty().await.unwrap();

        // no drift: nothing happens
        assert!(!service.reconcile().await.unwrap());

        // write behind the service's back
        let sandbox = service.inner.runtime.sandbox().await.unwrap();
        sandbox.write_file("built.js", "artifact").await.unwrap();

        assert!(service.reconcile().await.unwrap());
        assert!(service.find_node("built.js").await.is_some());
        // converged: a second pass sees no drift
        assert!(!service.reconcile().await.unwrap());
    }

    #[tokio::test]
    async fn test_search_files_matches_content() {
        let (_dir, service) = booted_service().await;
        service
            .create_file("src/app.tsx", "function App() {}")
            .await
            .unwrap();
        service.create_file("readme.md", "docs").await.unwrap();
        let hits = service.search_files("function app").await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path(), "src/app.tsx");
    }
}
