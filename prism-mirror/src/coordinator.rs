//! Propagation of one user's mutation to the master tree and peer mirrors.
//!
//! The coordinator is the listener behind the directory watcher. For every
//! create or delete observed inside a user's mirror it applies the identical
//! operation to the master tree and to every other entitled user's mirror,
//! skipping events the engine caused itself (the tracker echo check) so a
//! propagated write can never trigger a second round of fan-out.
//!
//! The fan-out always runs to completion: an I/O failure against one
//! destination is recorded in the [`PropagationReport`] and the remaining
//! destinations are still written. Callers are never blocked waiting for
//! full consistency across all mirrors.

use crate::entitlements::EntitlementResolver;
use crate::layout::{RepoLayout, UserObject};
use crate::replicator::TreeReplicator;
use crate::tracker::PathTracker;
use crate::watcher::MirrorListener;
use async_trait::async_trait;
use parking_lot::Mutex;
use prism_core::error::{PrismError, Result};
use prism_core::types::PropagationReport;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Listens for mutations in user mirrors and fans them out.
pub struct MirrorCoordinator {
    layout: Arc<RepoLayout>,
    tracker: Arc<PathTracker>,
    replicator: Arc<TreeReplicator>,
    entitlements: Arc<dyn EntitlementResolver>,
    last_report: Mutex<Option<PropagationReport>>,
}

impl MirrorCoordinator {
    pub fn new(
        layout: Arc<RepoLayout>,
        tracker: Arc<PathTracker>,
        replicator: Arc<TreeReplicator>,
        entitlements: Arc<dyn EntitlementResolver>,
    ) -> Self {
        Self {
            layout,
            tracker,
            replicator,
            entitlements,
            last_report: Mutex::new(None),
        }
    }

    /// The report of the most recent propagation, if any.
    pub fn last_report(&self) -> Option<PropagationReport> {
        self.last_report.lock().clone()
    }

    /// Propagate a creation observed at `path` inside a user's mirror.
    ///
    /// Replicates the object into the master tree, then into the mirror of
    /// every entitled user other than the originator. Self-caused events are
    /// discarded before any resolution happens.
    pub async fn propagate_create(&self, path: &Path) -> Result<PropagationReport> {
        let start = Instant::now();
        let mut report = PropagationReport::default();

        if self.tracker.is_tracked(path) {
            debug!("Discarding echo of own write: {}", path.display());
            report.suppressed = true;
            return Ok(self.finish(report, start));
        }

        let origin = self.layout.parse_user_path(path)?;
        debug!(
            "Propagating create of {} by user '{}' in project '{}'",
            path.display(),
            origin.user,
            origin.project
        );

        let master_dest = origin.to_master().abs_path(&self.layout);
        match self.replicator.replicate(path, &master_dest).await {
            Ok(replication) => {
                report.master_writes += 1;
                report.errors.extend(replication.errors);
            }
            Err(e) => {
                report
                    .errors
                    .push(format!("master write {}: {e}", master_dest.display()));
            }
        }

        for peer in self.resolve_peers(&origin, &mut report).await {
            let dest = origin
                .to_master()
                .for_user(peer, origin.mode)
                .abs_path(&self.layout);
            match self.replicator.replicate(path, &dest).await {
                Ok(replication) => {
                    report.peer_writes += 1;
                    report.errors.extend(replication.errors);
                }
                Err(e) => {
                    report
                        .errors
                        .push(format!("peer write {}: {e}", dest.display()));
                }
            }
        }

        Ok(self.finish(report, start))
    }

    /// Propagate a deletion observed at `path` inside a user's mirror.
    ///
    /// Removal of an already-absent target is a successful no-op; any other
    /// removal failure leaves mirrors inconsistent and is surfaced in the
    /// report rather than swallowed.
    pub async fn propagate_delete(&self, path: &Path) -> Result<PropagationReport> {
        let start = Instant::now();
        let mut report = PropagationReport::default();

        if self.tracker.is_tracked(path) {
            debug!("Discarding echo of own removal: {}", path.display());
            report.suppressed = true;
            return Ok(self.finish(report, start));
        }

        let origin = self.layout.parse_user_path(path)?;
        debug!(
            "Propagating delete of {} by user '{}' in project '{}'",
            path.display(),
            origin.user,
            origin.project
        );

        let master_dest = origin.to_master().abs_path(&self.layout);
        match self.replicator.remove(&master_dest).await {
            Ok(removal) => {
                report.master_writes += 1;
                report.errors.extend(removal.errors);
            }
            Err(e) => {
                report
                    .errors
                    .push(format!("master removal {}: {e}", master_dest.display()));
            }
        }

        for peer in self.resolve_peers(&origin, &mut report).await {
            let dest = origin
                .to_master()
                .for_user(peer, origin.mode)
                .abs_path(&self.layout);
            match self.replicator.remove(&dest).await {
                Ok(removal) => {
                    report.peer_writes += 1;
                    report.errors.extend(removal.errors);
                }
                Err(e) => {
                    report
                        .errors
                        .push(format!("peer removal {}: {e}", dest.display()));
                }
            }
        }

        Ok(self.finish(report, start))
    }

    /// Entitled users other than the originator.
    ///
    /// Resolution failure is recorded and yields no peers: the master write
    /// has already happened, and guessing at the peer set would scatter
    /// partial state.
    async fn resolve_peers(
        &self,
        origin: &UserObject,
        report: &mut PropagationReport,
    ) -> Vec<prism_core::types::Username> {
        match self.entitlements.users_with_access(&origin.project).await {
            Ok(users) => users.into_iter().filter(|u| *u != origin.user).collect(),
            Err(e) => {
                warn!(
                    "Entitlement resolution failed for project '{}': {e}",
                    origin.project
                );
                report
                    .errors
                    .push(format!("entitlements for project '{}': {e}", origin.project));
                Vec::new()
            }
        }
    }

    fn finish(&self, mut report: PropagationReport, start: Instant) -> PropagationReport {
        report.duration_ms = start.elapsed().as_millis() as u64;
        if !report.is_clean() {
            warn!(
                "Propagation completed with {} failure(s): {:?}",
                report.errors.len(),
                report.errors
            );
        }
        *self.last_report.lock() = Some(report.clone());
        report
    }
}

#[async_trait]
impl MirrorListener for MirrorCoordinator {
    async fn on_file_created(&self, path: &Path) -> Result<()> {
        self.propagate_create(path).await.map(|_| ())
    }

    async fn on_file_deleted(&self, path: &Path) -> Result<()> {
        self.propagate_delete(path).await.map(|_| ())
    }

    async fn on_file_modified(&self, path: &Path) -> Result<()> {
        Err(PrismError::invariant(format!(
            "files are never modified in place in a mirror: {}",
            path.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlements::MockEntitlementResolver;
    use crate::replicator::ReplicationOptions;
    use prism_core::types::Username;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::time::Duration;

    struct Fixture {
        _temp: tempfile::TempDir,
        layout: Arc<RepoLayout>,
        tracker: Arc<PathTracker>,
        replicator: Arc<TreeReplicator>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().unwrap();
            let master = temp.path().join("master");
            let users = temp.path().join("users");
            std::fs::create_dir(&master).unwrap();
            std::fs::create_dir(&users).unwrap();

            let layout = Arc::new(RepoLayout::new(&master, &users));
            let tracker = Arc::new(PathTracker::new(1024, Duration::from_secs(60)));
            let replicator = Arc::new(TreeReplicator::new(
                Arc::clone(&tracker),
                ReplicationOptions::default(),
            ));

            Self {
                _temp: temp,
                layout,
                tracker,
                replicator,
            }
        }

        fn coordinator(&self, entitlements: Arc<dyn EntitlementResolver>) -> MirrorCoordinator {
            MirrorCoordinator::new(
                Arc::clone(&self.layout),
                Arc::clone(&self.tracker),
                Arc::clone(&self.replicator),
                entitlements,
            )
        }

        /// Provision a user's project directory and return it.
        fn provision(&self, user: &str, project: &str) -> PathBuf {
            let dir = self
                .layout
                .users_root()
                .join(user)
                .join("readWrite")
                .join(project);
            std::fs::create_dir_all(&dir).unwrap();
            dir
        }

        fn master_project(&self, project: &str) -> PathBuf {
            let dir = self.layout.master_root().join(project);
            std::fs::create_dir_all(&dir).unwrap();
            dir
        }
    }

    fn entitled(users: &[&str]) -> Arc<MockEntitlementResolver> {
        let set: HashSet<Username> = users
            .iter()
            .map(|u| Username::new(*u).unwrap())
            .collect();
        let mut mock = MockEntitlementResolver::new();
        mock.expect_users_with_access()
            .returning(move |_| Ok(set.clone()));
        Arc::new(mock)
    }

    #[cfg(unix)]
    fn inode(path: &Path) -> u64 {
        use std::os::unix::fs::MetadataExt;
        std::fs::metadata(path).unwrap().ino()
    }

    #[tokio::test]
    async fn test_create_fans_out_to_master_and_peers() {
        let fixture = Fixture::new();
        fixture.master_project("proj1");
        let alice_dir = fixture.provision("alice", "proj1");
        fixture.provision("bob", "proj1");
        fixture.provision("carol", "proj1");

        let source = alice_dir.join("notes.txt");
        std::fs::write(&source, b"hello").unwrap();

        let coordinator = fixture.coordinator(entitled(&["alice", "bob", "carol"]));
        let report = coordinator.propagate_create(&source).await.unwrap();

        assert!(report.is_clean(), "errors: {:?}", report.errors);
        assert!(!report.suppressed);
        // Exactly one master write plus N-1 peer writes
        assert_eq!(report.master_writes, 1);
        assert_eq!(report.peer_writes, 2);

        let master_copy = fixture.layout.master_root().join("proj1/notes.txt");
        let bob_copy = fixture
            .layout
            .users_root()
            .join("bob/readWrite/proj1/notes.txt");
        let carol_copy = fixture
            .layout
            .users_root()
            .join("carol/readWrite/proj1/notes.txt");
        assert!(master_copy.exists());
        assert!(bob_copy.exists());
        assert!(carol_copy.exists());
        // The originator's own mirror is not written a second time
        #[cfg(unix)]
        {
            assert_eq!(inode(&source), inode(&master_copy));
            assert_eq!(inode(&source), inode(&bob_copy));
        }
    }

    #[tokio::test]
    async fn test_tracked_event_is_suppressed() {
        let fixture = Fixture::new();
        let alice_dir = fixture.provision("alice", "proj1");
        let source = alice_dir.join("echo.txt");
        std::fs::write(&source, b"x").unwrap();
        fixture.tracker.record(&source);

        let mut mock = MockEntitlementResolver::new();
        mock.expect_users_with_access().never();
        let coordinator = fixture.coordinator(Arc::new(mock));

        let report = coordinator.propagate_create(&source).await.unwrap();
        assert!(report.suppressed);
        assert_eq!(report.master_writes, 0);
        assert_eq!(report.peer_writes, 0);
    }

    #[tokio::test]
    async fn test_propagated_writes_are_recorded_for_suppression() {
        let fixture = Fixture::new();
        fixture.master_project("proj1");
        let alice_dir = fixture.provision("alice", "proj1");
        fixture.provision("bob", "proj1");

        let source = alice_dir.join("notes.txt");
        std::fs::write(&source, b"x").unwrap();

        let coordinator = fixture.coordinator(entitled(&["alice", "bob"]));
        coordinator.propagate_create(&source).await.unwrap();

        // The write into bob's mirror must be discarded when it comes back
        // around as an event, not fanned out a second time
        let bob_copy = fixture
            .layout
            .users_root()
            .join("bob/readWrite/proj1/notes.txt");
        let echo = coordinator.propagate_create(&bob_copy).await.unwrap();
        assert!(echo.suppressed);
        assert_eq!(echo.peer_writes, 0);
    }

    #[tokio::test]
    async fn test_path_outside_users_root_is_invariant_violation() {
        let fixture = Fixture::new();
        let coordinator = fixture.coordinator(entitled(&[]));

        let stray = fixture.layout.master_root().join("proj1/file.txt");
        let err = coordinator.propagate_create(&stray).await.unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let fixture = Fixture::new();
        fixture.master_project("proj1");
        let alice_dir = fixture.provision("alice", "proj1");
        fixture.provision("bob", "proj1");

        // The path never existed anywhere; deletion must still be clean
        let ghost = alice_dir.join("ghost.txt");
        let coordinator = fixture.coordinator(entitled(&["alice", "bob"]));
        let report = coordinator.propagate_delete(&ghost).await.unwrap();

        assert!(report.is_clean(), "errors: {:?}", report.errors);
        assert_eq!(report.master_writes, 1);
        assert_eq!(report.peer_writes, 1);
    }

    #[tokio::test]
    async fn test_delete_removes_master_and_peer_copies() {
        let fixture = Fixture::new();
        fixture.master_project("proj1");
        let alice_dir = fixture.provision("alice", "proj1");
        fixture.provision("bob", "proj1");

        let source = alice_dir.join("notes.txt");
        std::fs::write(&source, b"x").unwrap();

        let coordinator = fixture.coordinator(entitled(&["alice", "bob"]));
        coordinator.propagate_create(&source).await.unwrap();

        let master_copy = fixture.layout.master_root().join("proj1/notes.txt");
        let bob_copy = fixture
            .layout
            .users_root()
            .join("bob/readWrite/proj1/notes.txt");
        assert!(master_copy.exists() && bob_copy.exists());

        // The user deletes their copy; the event path no longer exists
        std::fs::remove_file(&source).unwrap();
        let report = coordinator.propagate_delete(&source).await.unwrap();

        assert!(report.is_clean(), "errors: {:?}", report.errors);
        assert!(!master_copy.exists());
        assert!(!bob_copy.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_partial_failure_does_not_stop_fan_out() {
        use std::os::unix::fs::PermissionsExt;

        let fixture = Fixture::new();
        fixture.master_project("proj1");
        let alice_dir = fixture.provision("alice", "proj1");
        let bob_dir = fixture.provision("bob", "proj1");
        fixture.provision("carol", "proj1");

        // Bob's project directory rejects writes
        std::fs::set_permissions(&bob_dir, std::fs::Permissions::from_mode(0o500)).unwrap();

        let source = alice_dir.join("notes.txt");
        std::fs::write(&source, b"x").unwrap();

        let coordinator = fixture.coordinator(entitled(&["alice", "bob", "carol"]));
        let report = coordinator.propagate_create(&source).await.unwrap();

        // Restore so the tempdir can be cleaned up
        std::fs::set_permissions(&bob_dir, std::fs::Permissions::from_mode(0o700)).unwrap();

        assert!(!report.is_clean());
        assert!(
            fixture
                .layout
                .users_root()
                .join("carol/readWrite/proj1/notes.txt")
                .exists(),
            "carol's mirror must still receive the file"
        );
        assert!(
            fixture.layout.master_root().join("proj1/notes.txt").exists(),
            "master must still receive the file"
        );
    }

    #[tokio::test]
    async fn test_entitlement_failure_is_reported_not_fatal() {
        let fixture = Fixture::new();
        fixture.master_project("proj1");
        let alice_dir = fixture.provision("alice", "proj1");

        let source = alice_dir.join("notes.txt");
        std::fs::write(&source, b"x").unwrap();

        let mut mock = MockEntitlementResolver::new();
        mock.expect_users_with_access()
            .returning(|p| Err(PrismError::not_found("project", p.as_str())));
        let coordinator = fixture.coordinator(Arc::new(mock));

        let report = coordinator.propagate_create(&source).await.unwrap();
        assert_eq!(report.master_writes, 1);
        assert_eq!(report.peer_writes, 0);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_modified_is_rejected() {
        let fixture = Fixture::new();
        let coordinator = fixture.coordinator(entitled(&[]));
        let err = coordinator
            .on_file_modified(Path::new("/repo/users/a/readWrite/p/x"))
            .await
            .unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[tokio::test]
    async fn test_last_report_is_retained() {
        let fixture = Fixture::new();
        fixture.master_project("proj1");
        let alice_dir = fixture.provision("alice", "proj1");
        let source = alice_dir.join("notes.txt");
        std::fs::write(&source, b"x").unwrap();

        let coordinator = fixture.coordinator(entitled(&["alice"]));
        assert!(coordinator.last_report().is_none());

        coordinator.propagate_create(&source).await.unwrap();
        let report = coordinator.last_report().unwrap();
        assert_eq!(report.master_writes, 1);
    }

    #[tokio::test]
    async fn test_directory_create_replicates_subtree() {
        let fixture = Fixture::new();
        fixture.master_project("proj1");
        let alice_dir = fixture.provision("alice", "proj1");
        fixture.provision("bob", "proj1");

        let subdir = alice_dir.join("data");
        std::fs::create_dir(&subdir).unwrap();
        std::fs::write(subdir.join("rows.csv"), b"1,2").unwrap();

        let coordinator = fixture.coordinator(entitled(&["alice", "bob"]));
        let report = coordinator.propagate_create(&subdir).await.unwrap();

        assert!(report.is_clean(), "errors: {:?}", report.errors);
        assert!(
            fixture
                .layout
                .master_root()
                .join("proj1/data/rows.csv")
                .exists()
        );
        assert!(
            fixture
                .layout
                .users_root()
                .join("bob/readWrite/proj1/data/rows.csv")
                .exists()
        );
    }
}
