//! Core types and abstractions for the Prism mirror engine.
//!
//! This crate provides the foundational value types, error taxonomy, and
//! configuration used across all Prism components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{MirrorConfig, ReplicationConfig, TrackerConfig, WatcherConfig};
pub use error::{PrismError, Result};
pub use types::*;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{MirrorConfig, ReplicationConfig, TrackerConfig, WatcherConfig};
    pub use crate::error::{PrismError, Result};
    pub use crate::types::*;
}
