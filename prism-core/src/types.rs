//! Core value types shared across the Prism mirror engine.

use crate::error::{PrismError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// A validated user name.
///
/// User names become a single path segment under the users root, so they may
/// not be empty, contain separators or NUL, or alias the dot directories.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
    /// Create a new user name, rejecting anything that is not a clean path segment.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_segment(&name, "user name")?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Username {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A validated project system name, one path segment under every root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectName(String);

impl ProjectName {
    /// Create a new project name, rejecting anything that is not a clean path segment.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_segment(&name, "project name")?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ProjectName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn validate_segment(name: &str, what: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PrismError::invalid_input(format!("{what} must not be empty")));
    }
    if name == "." || name == ".." {
        return Err(PrismError::invalid_input(format!(
            "{what} must not be a dot directory: {name:?}"
        )));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(PrismError::invalid_input(format!(
            "{what} must be a single path segment: {name:?}"
        )));
    }
    Ok(())
}

/// Access mode of a user's view onto a project mirror.
///
/// The variant names map to the on-disk path segments of the users tree:
/// `<users_root>/<user>/<mode>/<project>/...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    /// The on-disk path segment for this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "readOnly",
            Self::ReadWrite => "readWrite",
        }
    }

    /// Parse an on-disk path segment back into a mode.
    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "readOnly" => Some(Self::ReadOnly),
            "readWrite" => Some(Self::ReadWrite),
            _ => None,
        }
    }

    /// All modes, in the order they appear on disk.
    pub fn all() -> [Self; 2] {
        [Self::ReadOnly, Self::ReadWrite]
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A filesystem change observed by the directory watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Created(PathBuf),
    Deleted(PathBuf),
    Modified(PathBuf),
}

impl FileEvent {
    /// The path the event refers to.
    pub fn path(&self) -> &Path {
        match self {
            Self::Created(p) | Self::Deleted(p) | Self::Modified(p) => p,
        }
    }
}

/// Outcome of replicating one source object into one destination tree.
///
/// Per-entry failures are collected here rather than aborting the walk; a
/// non-empty `errors` means the replication completed with errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationReport {
    /// Number of hard links created
    pub files_linked: usize,

    /// Number of directories created
    pub directories_created: usize,

    /// Entries skipped (collisions, symlinks, special files)
    pub skipped: usize,

    /// Entries removed (delete operations)
    pub removed: usize,

    /// Errors encountered
    pub errors: Vec<String>,

    /// Duration in milliseconds
    pub duration_ms: u64,
}

impl ReplicationReport {
    /// True when the operation completed without per-entry failures.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: ReplicationReport) {
        self.files_linked += other.files_linked;
        self.directories_created += other.directories_created;
        self.skipped += other.skipped;
        self.removed += other.removed;
        self.errors.extend(other.errors);
    }
}

/// Outcome of propagating one user mutation to the master tree and peer mirrors.
///
/// Callers only ever see "operation completed, possibly with partial
/// propagation failures recorded" -- they are never blocked on full
/// consistency across all mirrors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropagationReport {
    /// The event was an echo of the engine's own earlier write and was discarded
    pub suppressed: bool,

    /// Number of writes applied to the master tree
    pub master_writes: usize,

    /// Number of writes applied to peer mirrors
    pub peer_writes: usize,

    /// Per-destination failures; the fan-out always ran to completion
    pub errors: Vec<String>,

    /// Duration in milliseconds
    pub duration_ms: u64,
}

impl PropagationReport {
    /// True when every destination was written without failure.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}
