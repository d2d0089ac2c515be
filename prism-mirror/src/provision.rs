//! Provisioning of roots, master project directories, and user mounts.
//!
//! Provisioning runs before the watcher starts: roots are created owner-only
//! if absent, project directories are ensured in the master tree, and a
//! user's mount is a hard-link replica of the master project tree. All
//! writes go through the tracked replicator, so mounts created while the
//! watcher is already running do not trigger propagation.

use crate::layout::RepoLayout;
use crate::replicator::TreeReplicator;
use prism_core::error::Result;
use prism_core::types::{AccessMode, ProjectName, PropagationReport, ReplicationReport, Username};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Creates and tears down the on-disk structure the mirror engine operates on.
pub struct MirrorProvisioner {
    layout: Arc<RepoLayout>,
    replicator: Arc<TreeReplicator>,
}

impl MirrorProvisioner {
    pub fn new(layout: Arc<RepoLayout>, replicator: Arc<TreeReplicator>) -> Self {
        Self { layout, replicator }
    }

    /// Ensure both roots exist with owner-only permission, then validate the
    /// layout. Must succeed before anything else runs.
    pub async fn ensure_roots(&self) -> Result<()> {
        self.replicator
            .ensure_private_dir(self.layout.master_root())
            .await?;
        self.replicator
            .ensure_private_dir(self.layout.users_root())
            .await?;
        self.layout.validate()?;
        info!(
            "Repository roots ready: master {}, users {}",
            self.layout.master_root().display(),
            self.layout.users_root().display()
        );
        Ok(())
    }

    /// Ensure the project's directory exists in the master tree.
    pub async fn ensure_master_project(&self, project: &ProjectName) -> Result<PathBuf> {
        let dir = self.layout.master_root().join(project.as_str());
        self.replicator.ensure_private_dir(&dir).await
    }

    /// Ensure a user's mount of a project and fill it from the master tree.
    ///
    /// The mount directory is created owner-only, then the master project
    /// tree is replicated into it with hard links. Returns the mount path.
    pub async fn ensure_user_mount(
        &self,
        user: &Username,
        mode: AccessMode,
        project: &ProjectName,
    ) -> Result<PathBuf> {
        let master_dir = self.ensure_master_project(project).await?;

        let mount = self
            .layout
            .users_root()
            .join(user.as_str())
            .join(mode.as_str())
            .join(project.as_str());
        self.replicator.ensure_private_dir(&mount).await?;

        let report = self.replicator.replicate(&master_dir, &mount).await?;
        if !report.is_clean() {
            warn!(
                "Mount of project '{project}' for user '{user}' completed with {} failure(s)",
                report.errors.len()
            );
        }
        info!("Mounted project '{project}' for user '{user}' at {}", mount.display());
        Ok(mount)
    }

    /// Remove one user's mount of a project under every access mode.
    ///
    /// Absent mounts are no-ops; failures are collected in the report.
    pub async fn remove_user_mount(
        &self,
        user: &Username,
        project: &ProjectName,
    ) -> Result<ReplicationReport> {
        let mut report = ReplicationReport::default();

        for mode in AccessMode::all() {
            let mount = self
                .layout
                .users_root()
                .join(user.as_str())
                .join(mode.as_str())
                .join(project.as_str());
            report.merge(self.replicator.remove(&mount).await?);
        }

        if !report.is_clean() {
            warn!(
                "Unmounting project '{project}' for user '{user}' completed with {} failure(s)",
                report.errors.len()
            );
        }
        Ok(report)
    }

    /// Remove a project's directory from the master tree and from every
    /// user's mirror.
    ///
    /// Used when a project is deleted outright. Per-tree failures are
    /// aggregated; the teardown always runs to completion.
    pub async fn remove_project_everywhere(
        &self,
        project: &ProjectName,
    ) -> Result<PropagationReport> {
        let start = Instant::now();
        let mut report = PropagationReport::default();

        let master_dir = self.layout.master_root().join(project.as_str());
        info!("Removing directory {} and all its contents", master_dir.display());
        let removal = self.replicator.remove(&master_dir).await?;
        report.master_writes += 1;
        report.errors.extend(removal.errors);

        let mut user_dirs = tokio::fs::read_dir(self.layout.users_root()).await?;
        while let Some(entry) = user_dirs.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            for mode in AccessMode::all() {
                let mount = entry.path().join(mode.as_str()).join(project.as_str());
                match tokio::fs::try_exists(&mount).await {
                    Ok(true) => {
                        info!("Removing directory {} and all its contents", mount.display());
                        let removal = self.replicator.remove(&mount).await?;
                        report.peer_writes += 1;
                        report.errors.extend(removal.errors);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        report.errors.push(format!("probe {}: {e}", mount.display()));
                    }
                }
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replicator::ReplicationOptions;
    use crate::tracker::PathTracker;
    use std::time::Duration;

    struct Fixture {
        _temp: tempfile::TempDir,
        layout: Arc<RepoLayout>,
        tracker: Arc<PathTracker>,
        provisioner: MirrorProvisioner,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().unwrap();
            let layout = Arc::new(RepoLayout::new(
                temp.path().join("master"),
                temp.path().join("users"),
            ));
            let tracker = Arc::new(PathTracker::new(1024, Duration::from_secs(60)));
            let replicator = Arc::new(TreeReplicator::new(
                Arc::clone(&tracker),
                ReplicationOptions::default(),
            ));
            let provisioner = MirrorProvisioner::new(Arc::clone(&layout), replicator);

            Self {
                _temp: temp,
                layout,
                tracker,
                provisioner,
            }
        }
    }

    fn project(name: &str) -> ProjectName {
        ProjectName::new(name).unwrap()
    }

    fn user(name: &str) -> Username {
        Username::new(name).unwrap()
    }

    #[tokio::test]
    async fn test_ensure_roots_creates_and_validates() {
        let fixture = Fixture::new();
        fixture.provisioner.ensure_roots().await.unwrap();

        assert!(fixture.layout.master_root().is_dir());
        assert!(fixture.layout.users_root().is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            for root in [fixture.layout.master_root(), fixture.layout.users_root()] {
                let mode = std::fs::metadata(root).unwrap().permissions().mode() & 0o777;
                assert_eq!(mode, 0o700);
            }
        }
    }

    #[tokio::test]
    async fn test_ensure_user_mount_replicates_master_tree() {
        let fixture = Fixture::new();
        fixture.provisioner.ensure_roots().await.unwrap();

        let master_dir = fixture
            .provisioner
            .ensure_master_project(&project("proj1"))
            .await
            .unwrap();
        std::fs::write(master_dir.join("seed.txt"), b"seed").unwrap();

        let mount = fixture
            .provisioner
            .ensure_user_mount(&user("alice"), AccessMode::ReadWrite, &project("proj1"))
            .await
            .unwrap();

        assert_eq!(
            mount,
            fixture.layout.users_root().join("alice/readWrite/proj1")
        );
        assert!(mount.join("seed.txt").exists());
        // Mount writes are tracked so a running watcher will not propagate them
        assert!(fixture.tracker.is_tracked(&mount.join("seed.txt")));
    }

    #[tokio::test]
    async fn test_ensure_user_mount_is_idempotent() {
        let fixture = Fixture::new();
        fixture.provisioner.ensure_roots().await.unwrap();

        let alice = user("alice");
        let proj = project("proj1");
        fixture
            .provisioner
            .ensure_user_mount(&alice, AccessMode::ReadWrite, &proj)
            .await
            .unwrap();
        fixture
            .provisioner
            .ensure_user_mount(&alice, AccessMode::ReadWrite, &proj)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_remove_user_mount_handles_absent_mounts() {
        let fixture = Fixture::new();
        fixture.provisioner.ensure_roots().await.unwrap();

        let report = fixture
            .provisioner
            .remove_user_mount(&user("nobody"), &project("proj1"))
            .await
            .unwrap();
        assert!(report.is_clean());
        assert_eq!(report.removed, 0);
    }

    #[tokio::test]
    async fn test_remove_project_everywhere() {
        let fixture = Fixture::new();
        fixture.provisioner.ensure_roots().await.unwrap();

        let proj = project("proj1");
        let master_dir = fixture
            .provisioner
            .ensure_master_project(&proj)
            .await
            .unwrap();
        std::fs::write(master_dir.join("seed.txt"), b"s").unwrap();

        for name in ["alice", "bob"] {
            fixture
                .provisioner
                .ensure_user_mount(&user(name), AccessMode::ReadWrite, &proj)
                .await
                .unwrap();
        }

        let report = fixture
            .provisioner
            .remove_project_everywhere(&proj)
            .await
            .unwrap();

        assert!(report.is_clean(), "errors: {:?}", report.errors);
        assert_eq!(report.master_writes, 1);
        assert_eq!(report.peer_writes, 2);
        assert!(!master_dir.exists());
        assert!(
            !fixture
                .layout
                .users_root()
                .join("alice/readWrite/proj1")
                .exists()
        );
    }
}
