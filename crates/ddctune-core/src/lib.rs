//! The ddctune engine: adaptive per-display retry and sleep tuning for
//! DDC/MCCS exchanges.
//!
//! The [`Engine`] is the single context object. It owns the per-display
//! [`Registry`], the instrumented sleep clock, and the tunables; retry loops,
//! the dynamic sleep adaptor, and reporting all hang off it. Nothing in this
//! crate is process-global.

mod dsa;
mod engine;
mod loops;
mod record;
mod registry;
mod report;
mod sim;

pub use dsa::next_retry_step;
pub use engine::{Engine, EngineConfig};
pub use loops::MULTI_PART_MAX_BYTES;
pub use record::{
    CachedDsaState, DisplayRecord, DisplayState, InvocationBuffer, InvocationRecord,
    MultiplierSource, RecordDefaults, RetryBudget, TryHistogram, DEFAULT_ADJUSTMENT_INTERVAL,
    DEFAULT_LOOKBACK, MAX_RECENT_VALUES,
};
pub use registry::{RecordHandle, Registry};
pub use report::{
    report_record, ClassReport, DisplayReport, EngineReport, InvocationReport, ReportDepth,
    SleepStatsReport,
};
pub use sim::{SimHandle, SimOutcome, SimTransport};
