//! Facade over the ddctune workspace: adaptive per-display retry and
//! sleep tuning for DDC/MCCS over I²C.
//!
//! The member crates carry the implementation; this crate re-exports the
//! public surface and hosts the cross-crate integration tests.

pub use ddctune_cache as cache;
pub use ddctune_clock as clock;
pub use ddctune_types as types;

pub use ddctune_core::*;
