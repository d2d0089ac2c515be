//! Path layout of the master repository and the per-user mirrors.
//!
//! Every filesystem object the engine touches has two views:
//!
//! ```text
//! <master_root>/<project>/<rel_path>                      (master view)
//! <users_root>/<user>/<mode>/<project>/<rel_path>         (user view)
//! ```
//!
//! `MasterObject` and `UserObject` are plain value structs describing one
//! view each, convertible to the other. They carry no filesystem state, so a
//! descriptor for a not-yet-existing destination is a legitimate value;
//! existence and permission checks live in [`RepoLayout::validate`] as an
//! explicit, separate step.

use prism_core::error::{PrismError, Result};
use prism_core::types::{AccessMode, ProjectName, Username};
use std::path::{Component, Path, PathBuf};

/// The two provisioned roots the engine operates between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoLayout {
    master_root: PathBuf,
    users_root: PathBuf,
}

impl RepoLayout {
    /// Create a layout from the two root paths.
    pub fn new(master_root: impl Into<PathBuf>, users_root: impl Into<PathBuf>) -> Self {
        Self {
            master_root: master_root.into(),
            users_root: users_root.into(),
        }
    }

    /// Create a layout from a loaded configuration.
    pub fn from_config(config: &prism_core::MirrorConfig) -> Self {
        Self::new(&config.master_root, &config.users_root)
    }

    pub fn master_root(&self) -> &Path {
        &self.master_root
    }

    pub fn users_root(&self) -> &Path {
        &self.users_root
    }

    /// Validate that both roots exist and are usable by the process.
    ///
    /// Each root must exist, be a directory, and carry owner
    /// read/write/execute permission. Failing any of these is a fatal setup
    /// error; nothing in the engine may run against an unusable root.
    pub fn validate(&self) -> Result<()> {
        check_root(&self.master_root)?;
        check_root(&self.users_root)?;
        Ok(())
    }

    /// Decompose an absolute path inside the users tree into its user view.
    ///
    /// Paths outside the users root, with a mode segment that is not
    /// `readOnly`/`readWrite`, or too shallow to name a project are contract
    /// violations: the watcher only ever hands the engine paths under the
    /// users root, and the engine never writes outside the layout.
    pub fn parse_user_path(&self, path: &Path) -> Result<UserObject> {
        let rel = path.strip_prefix(&self.users_root).map_err(|_| {
            PrismError::invariant(format!(
                "path {} is outside the users root {}",
                path.display(),
                self.users_root.display()
            ))
        })?;

        let mut segments = normal_segments(rel)?;
        if segments.len() < 3 {
            return Err(PrismError::invariant(format!(
                "path {} does not reach a project: expected <user>/<mode>/<project>/...",
                path.display()
            )));
        }

        let rest = segments.split_off(3);
        let project = segments.remove(2);
        let mode = segments.remove(1);
        let user = segments.remove(0);

        let mode = AccessMode::from_segment(&mode).ok_or_else(|| {
            PrismError::invariant(format!("unknown access mode segment {mode:?} in {}", path.display()))
        })?;

        Ok(UserObject {
            user: Username::new(user)?,
            mode,
            project: ProjectName::new(project)?,
            rel_path: rest.iter().collect(),
        })
    }

    /// Decompose an absolute path inside the master tree into its master view.
    pub fn parse_master_path(&self, path: &Path) -> Result<MasterObject> {
        let rel = path.strip_prefix(&self.master_root).map_err(|_| {
            PrismError::invariant(format!(
                "path {} is outside the master root {}",
                path.display(),
                self.master_root.display()
            ))
        })?;

        let mut segments = normal_segments(rel)?;
        if segments.is_empty() {
            return Err(PrismError::invariant(format!(
                "path {} does not name a project",
                path.display()
            )));
        }

        let rest = segments.split_off(1);
        Ok(MasterObject {
            project: ProjectName::new(segments.remove(0))?,
            rel_path: rest.iter().collect(),
        })
    }
}

fn check_root(root: &Path) -> Result<()> {
    let meta = std::fs::metadata(root).map_err(|e| {
        PrismError::setup(format!("repository root {} is unusable: {e}", root.display()))
    })?;
    if !meta.is_dir() {
        return Err(PrismError::setup(format!(
            "repository root {} is not a directory",
            root.display()
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = meta.permissions().mode();
        if mode & 0o700 != 0o700 {
            return Err(PrismError::setup(format!(
                "repository root {} must be readable, writable, and executable by its owner (mode {:o})",
                root.display(),
                mode & 0o777
            )));
        }
    }

    Ok(())
}

/// Split a relative path into its normal UTF-8 segments, rejecting anything
/// that would escape or alias the layout (`..`, prefixes, non-UTF-8 names).
fn normal_segments(rel: &Path) -> Result<Vec<String>> {
    rel.components()
        .map(|c| match c {
            Component::Normal(seg) => seg
                .to_str()
                .map(str::to_owned)
                .ok_or_else(|| PrismError::invariant(format!("non-UTF-8 path segment in {}", rel.display()))),
            other => Err(PrismError::invariant(format!(
                "unexpected path component {other:?} in {}",
                rel.display()
            ))),
        })
        .collect()
}

/// A filesystem object addressed through the master tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterObject {
    pub project: ProjectName,
    /// Path of the object relative to the project directory; empty for the
    /// project directory itself
    pub rel_path: PathBuf,
}

impl MasterObject {
    pub fn new(project: ProjectName, rel_path: impl Into<PathBuf>) -> Self {
        Self {
            project,
            rel_path: rel_path.into(),
        }
    }

    /// Absolute path of this object in the master tree.
    pub fn abs_path(&self, layout: &RepoLayout) -> PathBuf {
        layout
            .master_root()
            .join(self.project.as_str())
            .join(&self.rel_path)
    }

    /// Absolute path of the containing project directory in the master tree.
    pub fn project_dir(&self, layout: &RepoLayout) -> PathBuf {
        layout.master_root().join(self.project.as_str())
    }

    /// The same object as seen through one user's mirror.
    pub fn for_user(&self, user: Username, mode: AccessMode) -> UserObject {
        UserObject {
            user,
            mode,
            project: self.project.clone(),
            rel_path: self.rel_path.clone(),
        }
    }
}

/// A filesystem object addressed through one user's mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserObject {
    pub user: Username,
    pub mode: AccessMode,
    pub project: ProjectName,
    /// Path of the object relative to the project directory; empty for the
    /// project directory itself
    pub rel_path: PathBuf,
}

impl UserObject {
    pub fn new(
        user: Username,
        mode: AccessMode,
        project: ProjectName,
        rel_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            user,
            mode,
            project,
            rel_path: rel_path.into(),
        }
    }

    /// Absolute path of this object in the user's mirror.
    pub fn abs_path(&self, layout: &RepoLayout) -> PathBuf {
        self.project_dir(layout).join(&self.rel_path)
    }

    /// Absolute path of the project directory in the user's mirror.
    pub fn project_dir(&self, layout: &RepoLayout) -> PathBuf {
        layout
            .users_root()
            .join(self.user.as_str())
            .join(self.mode.as_str())
            .join(self.project.as_str())
    }

    /// Absolute path of the user's top-level mirror directory.
    pub fn user_dir(&self, layout: &RepoLayout) -> PathBuf {
        layout.users_root().join(self.user.as_str())
    }

    /// The same object as seen through the master tree.
    pub fn to_master(&self) -> MasterObject {
        MasterObject {
            project: self.project.clone(),
            rel_path: self.rel_path.clone(),
        }
    }
}
