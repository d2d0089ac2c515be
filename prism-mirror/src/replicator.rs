//! Hard-link tree replication between the master tree and user mirrors.
//!
//! Replication never copies content: regular files become hard links sharing
//! the source inode, and directories are created fresh with owner-only
//! permission. Every path the replicator is about to create or remove is
//! recorded in the [`PathTracker`] first, so the filesystem notification the
//! mutation produces is recognized as self-caused.
//!
//! Failures on individual entries are collected into the returned
//! [`ReplicationReport`] and the walk continues; a partial replication is
//! preferred to aborting the whole tree.

use crate::tracker::PathTracker;
use ignore::WalkBuilder;
use prism_core::error::{PrismError, Result};
use prism_core::types::ReplicationReport;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tracing::{debug, error, warn};

/// Options for replication operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplicationOptions {
    /// Fail on destination collisions instead of tolerating them silently
    pub fail_on_collisions: bool,
}

impl From<&prism_core::ReplicationConfig> for ReplicationOptions {
    fn from(config: &prism_core::ReplicationConfig) -> Self {
        Self {
            fail_on_collisions: config.fail_on_collisions,
        }
    }
}

/// Replicates filesystem trees with hard links and tracked mutations.
pub struct TreeReplicator {
    tracker: Arc<PathTracker>,
    options: ReplicationOptions,
}

impl TreeReplicator {
    /// Create a new replicator recording its writes into the given tracker.
    pub fn new(tracker: Arc<PathTracker>, options: ReplicationOptions) -> Self {
        Self { tracker, options }
    }

    /// Replicate a source object (file or directory) to a destination path.
    ///
    /// A file source produces a single hard link at the destination. A
    /// directory source produces an isomorphic destination tree: owner-only
    /// directories, hard links for every regular file. Symbolic links and
    /// other non-regular objects are skipped with a warning.
    pub async fn replicate(&self, source: &Path, destination: &Path) -> Result<ReplicationReport> {
        let start = Instant::now();
        let mut report = ReplicationReport::default();

        let meta = fs::symlink_metadata(source).await.map_err(|e| {
            PrismError::replication(format!("source {} is unreadable: {e}", source.display()))
        })?;

        if meta.is_dir() {
            self.replicate_tree(source, destination, &mut report).await;
        } else if meta.is_file() {
            self.link_into(source, destination, &mut report).await;
        } else {
            warn!("Symbolic link or special file not mirrored: {}", source.display());
            report.skipped += 1;
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Create a single tracked hard link.
    pub async fn link_file(&self, source: &Path, destination: &Path) -> Result<ReplicationReport> {
        let start = Instant::now();
        let mut report = ReplicationReport::default();
        self.link_into(source, destination, &mut report).await;
        report.duration_ms = start.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Walk a source directory and mirror it under `destination`.
    async fn replicate_tree(&self, source: &Path, destination: &Path, report: &mut ReplicationReport) {
        let walker = WalkBuilder::new(source)
            .standard_filters(false)
            .follow_links(false)
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    error!("Unable to visit entry under {}: {e}", source.display());
                    report.errors.push(format!("walk error under {}: {e}", source.display()));
                    continue;
                }
            };

            let path = entry.path();
            let target = match path.strip_prefix(source) {
                Ok(rel) => destination.join(rel),
                Err(e) => {
                    report.errors.push(format!(
                        "entry {} escaped source {}: {e}",
                        path.display(),
                        source.display()
                    ));
                    continue;
                }
            };

            let Some(file_type) = entry.file_type() else {
                report.errors.push(format!("no file type for {}", path.display()));
                continue;
            };

            if file_type.is_dir() {
                self.create_private_dir(&target, report).await;
            } else if file_type.is_file() {
                self.link_into(path, &target, report).await;
            } else {
                warn!("Symbolic link or special file not mirrored: {}", path.display());
                report.skipped += 1;
            }
        }
    }

    /// Create one owner-only directory, tracked, tolerating existing ones.
    async fn create_private_dir(&self, dir: &Path, report: &mut ReplicationReport) {
        self.tracker.record(dir);

        match fs::create_dir(dir).await {
            Ok(()) => {
                report.directories_created += 1;
                if let Err(e) = clamp_to_owner_only(dir).await {
                    error!("Unable to restrict permissions on {}: {e}", dir.display());
                    report
                        .errors
                        .push(format!("permissions on {}: {e}", dir.display()));
                }
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                self.tracker.forget(dir);
                debug!("Directory already present: {}", dir.display());
            }
            Err(e) => {
                // The subtree's files will fail to link as well; each failure
                // is collected individually and the walk goes on.
                self.tracker.forget(dir);
                error!("Unable to create directory {}: {e}", dir.display());
                report.errors.push(format!("create {}: {e}", dir.display()));
            }
        }
    }

    /// Create one tracked hard link, applying the collision policy.
    async fn link_into(&self, source: &Path, destination: &Path, report: &mut ReplicationReport) {
        match fs::try_exists(destination).await {
            Ok(true) => {
                self.collision(destination, report);
                return;
            }
            Ok(false) => {}
            Err(e) => {
                report
                    .errors
                    .push(format!("probe {}: {e}", destination.display()));
                return;
            }
        }

        self.tracker.record(destination);
        debug!(
            "Creating hard link from {} to {}",
            destination.display(),
            source.display()
        );

        match fs::hard_link(source, destination).await {
            Ok(()) => report.files_linked += 1,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // Raced with another link creation; same policy as a probe hit
                self.tracker.forget(destination);
                self.collision(destination, report);
            }
            Err(e) => {
                self.tracker.forget(destination);
                error!(
                    "Unable to create hard link from {} to {}: {e}",
                    destination.display(),
                    source.display()
                );
                report
                    .errors
                    .push(format!("link {}: {e}", destination.display()));
            }
        }
    }

    fn collision(&self, destination: &Path, report: &mut ReplicationReport) {
        if self.options.fail_on_collisions {
            report
                .errors
                .push(format!("destination already exists: {}", destination.display()));
        } else {
            debug!("Destination already exists, tolerated: {}", destination.display());
            report.skipped += 1;
        }
    }

    /// Ensure a directory (and its missing parents) exists with owner-only
    /// permission, tracking every component this call creates.
    pub async fn ensure_private_dir(&self, path: &Path) -> Result<PathBuf> {
        let mut missing = Vec::new();
        let mut cursor = path;
        loop {
            if fs::try_exists(cursor).await.unwrap_or(false) {
                break;
            }
            missing.push(cursor.to_path_buf());
            match cursor.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => cursor = parent,
                _ => break,
            }
        }

        if missing.is_empty() {
            let meta = fs::metadata(path).await?;
            if !meta.is_dir() {
                return Err(PrismError::replication(format!(
                    "{} exists but is not a directory",
                    path.display()
                )));
            }
            return Ok(path.to_path_buf());
        }

        for dir in missing.iter().rev() {
            self.tracker.record(dir);
            match fs::create_dir(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    self.tracker.forget(dir);
                    continue;
                }
                Err(e) => {
                    self.tracker.forget(dir);
                    return Err(PrismError::replication(format!(
                        "unable to create directory {}: {e}",
                        dir.display()
                    )));
                }
            }
            clamp_to_owner_only(dir).await.map_err(|e| {
                PrismError::replication(format!("permissions on {}: {e}", dir.display()))
            })?;
        }

        Ok(path.to_path_buf())
    }

    /// Remove a path, tracking every deleted entry.
    ///
    /// An absent path is a successful no-op. Directories are removed
    /// bottom-up; per-entry failures are collected and removal continues.
    pub async fn remove(&self, path: &Path) -> Result<ReplicationReport> {
        let start = Instant::now();
        let mut report = ReplicationReport::default();

        match fs::symlink_metadata(path).await {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Already absent, nothing to remove: {}", path.display());
            }
            Err(e) => {
                report.errors.push(format!("probe {}: {e}", path.display()));
            }
            Ok(meta) if meta.is_dir() => {
                self.remove_tree(path, &mut report).await;
            }
            Ok(_) => {
                self.remove_entry(path, false, &mut report).await;
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Remove a directory tree bottom-up with per-entry tracking.
    async fn remove_tree(&self, root: &Path, report: &mut ReplicationReport) {
        let mut entries: Vec<(PathBuf, bool)> = Vec::new();
        let walker = WalkBuilder::new(root)
            .standard_filters(false)
            .follow_links(false)
            .build();

        for entry in walker {
            match entry {
                Ok(entry) => {
                    let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
                    entries.push((entry.into_path(), is_dir));
                }
                Err(e) => {
                    report.errors.push(format!("walk error under {}: {e}", root.display()));
                }
            }
        }

        // The walk is pre-order; reversing yields children before parents
        for (path, is_dir) in entries.iter().rev() {
            self.remove_entry(path, *is_dir, report).await;
        }
    }

    async fn remove_entry(&self, path: &Path, is_dir: bool, report: &mut ReplicationReport) {
        self.tracker.record(path);

        let result = if is_dir {
            fs::remove_dir(path).await
        } else {
            fs::remove_file(path).await
        };

        match result {
            Ok(()) => report.removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.tracker.forget(path);
                debug!("Already absent: {}", path.display());
            }
            Err(e) => {
                self.tracker.forget(path);
                error!("Unable to remove {}: {e}", path.display());
                report.errors.push(format!("remove {}: {e}", path.display()));
            }
        }
    }
}

/// Restrict a directory to owner read/write/execute, regardless of umask.
async fn clamp_to_owner_only(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}
