//! Workspace-level integration test package for Prism.
//!
//! The actual functionality lives in `prism-core` and `prism-mirror`; this
//! package only hosts the cross-crate scenarios under `tests/`.
