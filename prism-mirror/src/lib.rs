//! Hard-link mirror engine for Prism.
//!
//! This crate keeps a master project tree and one private mirror per user
//! consistent under live filesystem events:
//! - `RepoLayout` / `MasterObject` / `UserObject`: the two-view path layout
//! - `PathTracker`: bounded, time-expiring record of self-caused mutations
//! - `TreeReplicator`: hard-link tree replication with owner-only directories
//! - `DirectoryWatcher`: recursive watch with dynamic registration and a
//!   single dispatch loop
//! - `MirrorCoordinator`: per-event fan-out into the master tree and every
//!   entitled peer mirror
//! - `MirrorProvisioner`: roots, master project directories, user mounts
//!
//! Propagation relies on hard links being atomic, on the tracker suppressing
//! the engine's own echoes, and on the convention that two users never write
//! the identical relative path concurrently (last-writer-wins otherwise).
//!
//! # Example
//!
//! ```no_run
//! use prism_core::MirrorConfig;
//! use prism_mirror::{
//!     DirectoryWatcher, MirrorCoordinator, MirrorProvisioner, PathTracker, RepoLayout,
//!     StaticEntitlements, TreeReplicator,
//! };
//! use prism_mirror::replicator::ReplicationOptions;
//! use std::sync::Arc;
//!
//! # async fn example() -> prism_core::Result<()> {
//! let config = MirrorConfig::default();
//! let layout = Arc::new(RepoLayout::from_config(&config));
//! let tracker = Arc::new(PathTracker::from_config(&config.tracker));
//! let replicator = Arc::new(TreeReplicator::new(
//!     Arc::clone(&tracker),
//!     ReplicationOptions::from(&config.replication),
//! ));
//!
//! let provisioner = MirrorProvisioner::new(Arc::clone(&layout), Arc::clone(&replicator));
//! provisioner.ensure_roots().await?;
//!
//! let entitlements = Arc::new(StaticEntitlements::new());
//! let coordinator = Arc::new(MirrorCoordinator::new(
//!     layout.clone(),
//!     tracker,
//!     replicator,
//!     entitlements,
//! ));
//!
//! let watcher = DirectoryWatcher::new(config.watcher.clone());
//! watcher.register_listener(coordinator)?;
//! watcher.watch(layout.users_root())?;
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod entitlements;
pub mod layout;
pub mod provision;
pub mod replicator;
pub mod tracker;
pub mod watcher;

// Re-export main types
pub use coordinator::MirrorCoordinator;
pub use entitlements::{EntitlementResolver, StaticEntitlements};
pub use layout::{MasterObject, RepoLayout, UserObject};
pub use provision::MirrorProvisioner;
pub use replicator::{ReplicationOptions, TreeReplicator};
pub use tracker::{PathTracker, TrackerStats};
pub use watcher::{DirectoryWatcher, MirrorListener};

/// Prelude module with commonly used types.
pub mod prelude {
    pub use crate::coordinator::MirrorCoordinator;
    pub use crate::entitlements::{EntitlementResolver, StaticEntitlements};
    pub use crate::layout::{MasterObject, RepoLayout, UserObject};
    pub use crate::provision::MirrorProvisioner;
    pub use crate::replicator::{ReplicationOptions, TreeReplicator};
    pub use crate::tracker::{PathTracker, TrackerStats};
    pub use crate::watcher::{DirectoryWatcher, MirrorListener};
    pub use prism_core::types::{
        AccessMode, FileEvent, ProjectName, PropagationReport, ReplicationReport, Username,
    };
}
