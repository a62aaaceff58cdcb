//! Shared vocabulary for the ddctune engine: bus identity, retry operation
//! classes, the sleep-multiplier step ladder, the transport contract, and the
//! error taxonomy visible at the engine boundary.
//!
//! This crate is deliberately small and dependency-light so both sides of the
//! transport seam (the engine and any transport implementation) can share it.

mod bus;
mod error;
mod retry;
mod steps;
mod transport;

pub use bus::{BusPath, BusPathParseError};
pub use error::DdcError;
pub use retry::{LoopOutcome, RetryClass, MAX_MAX_TRIES};
pub use steps::{multiplier_to_step, step_to_multiplier, STEPS, STEP_COUNT, STEP_LAST};
pub use transport::{classify, EdidSource, ErrorClass, Transport, TransportError};
