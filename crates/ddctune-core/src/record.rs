//! The per-display record: everything the engine has learned about one
//! monitor on one bus. DSA state lives inline here; the controller logic
//! that mutates it is in [`crate::dsa`].

use std::collections::VecDeque;

use ddctune_types::{
    multiplier_to_step, BusPath, LoopOutcome, RetryClass, MAX_MAX_TRIES, STEP_LAST,
};

/// Records the DSA inspects when deciding whether to move the step.
pub const MAX_RECENT_VALUES: usize = 20;

/// How many recent successful invocations the scan looks at by default.
pub const DEFAULT_LOOKBACK: usize = 5;

/// How many marginal successes are tolerated between scans.
pub const DEFAULT_ADJUSTMENT_INTERVAL: u32 = 3;

bitflags::bitflags! {
    /// Lifecycle flags of a per-display record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DisplayState: u8 {
        /// The bus has been seen live during this program run.
        const BUS_DETECTED = 0b001;
        /// The record was restored from the stats cache.
        const FROM_CACHE = 0b010;
        /// The cached EDID checksum byte matched the live monitor.
        const EDID_VERIFIED = 0b100;
    }
}

/// Where the user-requested sleep multiplier came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiplierSource {
    Default,
    Explicit,
    Reset,
}

impl MultiplierSource {
    pub const fn name(self) -> &'static str {
        match self {
            MultiplierSource::Default => "default",
            MultiplierSource::Explicit => "explicit",
            MultiplierSource::Reset => "reset",
        }
    }
}

/// One successful retry-loop completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvocationRecord {
    pub epoch_seconds: u64,
    pub try_count: u8,
    pub required_step: usize,
}

/// Bounded FIFO of successful invocations; appending past capacity drops the
/// oldest record. Logical index 0 is always the oldest surviving record.
#[derive(Debug, Clone, Default)]
pub struct InvocationBuffer {
    records: VecDeque<InvocationRecord>,
}

impl InvocationBuffer {
    pub fn push(&mut self, record: InvocationRecord) {
        assert!(
            record.try_count >= 1
                && record.try_count <= MAX_MAX_TRIES
                && record.required_step <= STEP_LAST,
            "invocation record out of range: {record:?}"
        );
        if self.records.len() == MAX_RECENT_VALUES {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Logical retrieval, index 0 = oldest.
    pub fn get(&self, index: usize) -> Option<InvocationRecord> {
        self.records.get(index).copied()
    }

    /// The most recent `n` records, oldest of them first.
    pub fn latest(&self, n: usize) -> Vec<InvocationRecord> {
        let skip = self.records.len().saturating_sub(n);
        self.records.iter().skip(skip).copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = InvocationRecord> + '_ {
        self.records.iter().copied()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

/// Retry budget for one operation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    current: u8,
    highest_ever: u8,
    lowest_ever: u8,
}

impl RetryBudget {
    fn new(initial: u8) -> Self {
        assert!(
            (1..=MAX_MAX_TRIES).contains(&initial),
            "initial max tries {initial} out of range"
        );
        RetryBudget {
            current: initial,
            highest_ever: initial,
            lowest_ever: initial,
        }
    }

    fn set(&mut self, n: u8) {
        assert!(
            (1..=MAX_MAX_TRIES).contains(&n),
            "max tries {n} out of range"
        );
        self.current = n;
        self.highest_ever = self.highest_ever.max(n);
        self.lowest_ever = self.lowest_ever.min(n);
    }

    pub fn current(&self) -> u8 {
        self.current
    }

    pub fn highest_ever(&self) -> u8 {
        self.highest_ever
    }

    pub fn lowest_ever(&self) -> u8 {
        self.lowest_ever
    }
}

/// Per-class outcome histogram.
///
/// Index 0 counts fatal failures, index 1 counts exhausted-retries failures,
/// index `k >= 2` counts successes on try `k - 1`. The vector length covers
/// success on try [`MAX_MAX_TRIES`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryHistogram {
    counts: [u64; MAX_MAX_TRIES as usize + 2],
}

impl Default for TryHistogram {
    fn default() -> Self {
        TryHistogram {
            counts: [0; MAX_MAX_TRIES as usize + 2],
        }
    }
}

impl TryHistogram {
    pub fn record(&mut self, outcome: LoopOutcome, tries: u8) {
        assert!(
            (1..=MAX_MAX_TRIES).contains(&tries),
            "tries {tries} out of range"
        );
        let index = match outcome {
            LoopOutcome::Success => tries as usize + 1,
            LoopOutcome::RetriesExhausted | LoopOutcome::AllTriesZero => 1,
            LoopOutcome::Fatal => 0,
        };
        self.counts[index] += 1;
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Total retry loops recorded in this class.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Highest populated index, for bounding report output.
    pub fn highest_non_zero_index(&self) -> Option<usize> {
        self.counts.iter().rposition(|&c| c != 0)
    }
}

/// Defaults installed on record creation. Owned by the engine; `set_default_max_tries`
/// mutates these without touching existing records.
#[derive(Debug, Clone, Copy)]
pub struct RecordDefaults {
    pub user_multiplier: f64,
    pub max_tries: [u8; 4],
}

impl Default for RecordDefaults {
    fn default() -> Self {
        RecordDefaults {
            user_multiplier: 1.0,
            max_tries: [
                RetryClass::WriteOnly.default_max_tries(),
                RetryClass::WriteRead.default_max_tries(),
                RetryClass::MultiPartRead.default_max_tries(),
                RetryClass::MultiPartWrite.default_max_tries(),
            ],
        }
    }
}

/// DSA state restored from the stats cache.
#[derive(Debug, Clone)]
pub struct CachedDsaState {
    pub cur_step: usize,
    pub lookback: usize,
    pub remaining_interval: u32,
    pub min_ok_step: usize,
    pub found_failure_step: bool,
    pub recent: Vec<InvocationRecord>,
}

#[derive(Debug, Clone)]
pub struct DisplayRecord {
    bus: BusPath,
    edid_check: u8,
    state: DisplayState,

    budgets: [RetryBudget; 4],
    histograms: [TryHistogram; 4],

    user_multiplier: f64,
    user_multiplier_source: MultiplierSource,

    // DSA state. `cur_step` is the learned resting point; `cur_retry_loop_step`
    // is the possibly-higher step in force inside the current retry loop.
    pub(crate) cur_step: usize,
    pub(crate) cur_retry_loop_step: usize,
    pub(crate) min_ok_step: usize,
    pub(crate) found_failure_step: bool,
    pub(crate) lookback: usize,
    pub(crate) remaining_interval: u32,
    pub(crate) adjustment_interval: u32,
    pub(crate) initial_step: usize,
    pub(crate) initial_lookback: usize,

    pub(crate) adjustments_up: u64,
    pub(crate) adjustments_down: u64,
    pub(crate) successful_observations: u64,
    pub(crate) retryable_failures: u64,

    pub(crate) recent: InvocationBuffer,

    // Rolling extremes of the step multiplier in force at each success.
    pub(crate) ok_multiplier_min: f64,
    pub(crate) ok_multiplier_max: f64,
    pub(crate) ok_multiplier_sum: f64,
    pub(crate) ok_multiplier_count: u64,

    /// Requested sleep accumulated by retry loops on this display.
    pub(crate) total_sleep_millis: u64,
}

impl DisplayRecord {
    /// Fresh record for a live, EDID-verified bus.
    pub fn new(bus: BusPath, edid_check: u8, defaults: &RecordDefaults) -> Self {
        let initial_step = multiplier_to_step(defaults.user_multiplier);
        DisplayRecord {
            bus,
            edid_check,
            state: DisplayState::BUS_DETECTED | DisplayState::EDID_VERIFIED,
            budgets: defaults.max_tries.map(RetryBudget::new),
            histograms: Default::default(),
            user_multiplier: defaults.user_multiplier,
            user_multiplier_source: MultiplierSource::Default,
            cur_step: initial_step,
            cur_retry_loop_step: initial_step,
            min_ok_step: 0,
            found_failure_step: false,
            lookback: DEFAULT_LOOKBACK,
            remaining_interval: DEFAULT_ADJUSTMENT_INTERVAL,
            adjustment_interval: DEFAULT_ADJUSTMENT_INTERVAL,
            initial_step,
            initial_lookback: DEFAULT_LOOKBACK,
            adjustments_up: 0,
            adjustments_down: 0,
            successful_observations: 0,
            retryable_failures: 0,
            recent: InvocationBuffer::default(),
            ok_multiplier_min: 0.0,
            ok_multiplier_max: 0.0,
            ok_multiplier_sum: 0.0,
            ok_multiplier_count: 0,
            total_sleep_millis: 0,
        }
    }

    /// Record restored from the stats cache. Carries `FROM_CACHE` only; the
    /// first live `get_or_create` must verify the EDID byte before the record
    /// may be used.
    pub fn from_cache(
        bus: BusPath,
        edid_check: u8,
        cached: CachedDsaState,
        defaults: &RecordDefaults,
    ) -> Self {
        let mut record = DisplayRecord::new(bus, edid_check, defaults);
        record.state = DisplayState::FROM_CACHE;
        record.cur_step = cached.cur_step;
        record.cur_retry_loop_step = cached.cur_step;
        record.initial_step = cached.cur_step;
        record.lookback = cached.lookback;
        record.initial_lookback = cached.lookback;
        record.remaining_interval = cached.remaining_interval;
        record.min_ok_step = cached.min_ok_step;
        record.found_failure_step = cached.found_failure_step;
        for rec in cached.recent {
            record.recent.push(rec);
        }
        record.assert_invariants();
        record
    }

    pub fn bus(&self) -> BusPath {
        self.bus
    }

    pub fn edid_check(&self) -> u8 {
        self.edid_check
    }

    pub fn state(&self) -> DisplayState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: DisplayState) {
        self.state = state;
    }

    pub(crate) fn mark_detected_and_verified(&mut self) {
        self.state |= DisplayState::BUS_DETECTED | DisplayState::EDID_VERIFIED;
    }

    pub fn user_multiplier(&self) -> f64 {
        self.user_multiplier
    }

    pub fn user_multiplier_source(&self) -> MultiplierSource {
        self.user_multiplier_source
    }

    pub fn set_user_multiplier(&mut self, multiplier: f64, source: MultiplierSource) {
        assert!(
            multiplier.is_finite() && multiplier >= 0.0,
            "user multiplier {multiplier} out of range"
        );
        self.user_multiplier = multiplier;
        self.user_multiplier_source = source;
    }

    pub fn max_tries(&self, class: RetryClass) -> u8 {
        self.budgets[class.index()].current()
    }

    pub fn budget(&self, class: RetryClass) -> &RetryBudget {
        &self.budgets[class.index()]
    }

    pub fn set_max_tries(&mut self, class: RetryClass, n: u8) {
        self.budgets[class.index()].set(n);
    }

    pub fn record_attempt(&mut self, class: RetryClass, outcome: LoopOutcome, tries: u8) {
        self.histograms[class.index()].record(outcome, tries);
    }

    pub fn histogram(&self, class: RetryClass) -> &TryHistogram {
        &self.histograms[class.index()]
    }

    pub fn total_tries_for_class(&self, class: RetryClass) -> u64 {
        self.histograms[class.index()].total()
    }

    pub fn highest_non_zero_index(&self, class: RetryClass) -> Option<usize> {
        self.histograms[class.index()].highest_non_zero_index()
    }

    pub fn cur_step(&self) -> usize {
        self.cur_step
    }

    pub fn cur_retry_loop_step(&self) -> usize {
        self.cur_retry_loop_step
    }

    pub fn min_ok_step(&self) -> usize {
        self.min_ok_step
    }

    pub fn found_failure_step(&self) -> bool {
        self.found_failure_step
    }

    pub fn lookback(&self) -> usize {
        self.lookback
    }

    pub fn remaining_interval(&self) -> u32 {
        self.remaining_interval
    }

    pub fn initial_step(&self) -> usize {
        self.initial_step
    }

    pub fn initial_lookback(&self) -> usize {
        self.initial_lookback
    }

    pub fn adjustments_up(&self) -> u64 {
        self.adjustments_up
    }

    pub fn adjustments_down(&self) -> u64 {
        self.adjustments_down
    }

    pub fn successful_observations(&self) -> u64 {
        self.successful_observations
    }

    pub fn retryable_failures(&self) -> u64 {
        self.retryable_failures
    }

    pub fn recent(&self) -> &InvocationBuffer {
        &self.recent
    }

    pub fn total_sleep_millis(&self) -> u64 {
        self.total_sleep_millis
    }

    pub(crate) fn note_sleep(&mut self, millis: u64) {
        self.total_sleep_millis += millis;
    }

    /// Verify the DSA state invariants. A violation is a programmer error:
    /// continuing would corrupt learned (and persisted) state, so crash.
    pub(crate) fn assert_invariants(&self) {
        assert!(
            self.cur_step <= STEP_LAST,
            "cur_step {} out of range",
            self.cur_step
        );
        assert!(
            self.cur_retry_loop_step <= STEP_LAST,
            "cur_retry_loop_step {} out of range",
            self.cur_retry_loop_step
        );
        assert!(
            self.cur_retry_loop_step >= self.cur_step,
            "loop step {} below learned step {}",
            self.cur_retry_loop_step,
            self.cur_step
        );
        if self.found_failure_step {
            assert!(
                self.min_ok_step <= self.cur_step,
                "min_ok_step {} above cur_step {}",
                self.min_ok_step,
                self.cur_step
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DisplayRecord {
        DisplayRecord::new(BusPath::new(4), 0xA7, &RecordDefaults::default())
    }

    #[test]
    fn new_record_starts_at_the_user_multiplier_step() {
        let r = record();
        assert_eq!(r.cur_step(), 7);
        assert_eq!(r.cur_retry_loop_step(), 7);
        assert_eq!(r.initial_step(), 7);
        assert!(!r.found_failure_step());
        assert_eq!(r.state(), DisplayState::BUS_DETECTED | DisplayState::EDID_VERIFIED);
    }

    #[test]
    fn budget_tracks_extremes() {
        let mut r = record();
        assert_eq!(r.max_tries(RetryClass::WriteRead), 4);
        r.set_max_tries(RetryClass::WriteRead, 10);
        r.set_max_tries(RetryClass::WriteRead, 2);
        let budget = r.budget(RetryClass::WriteRead);
        assert_eq!(budget.current(), 2);
        assert_eq!(budget.highest_ever(), 10);
        assert_eq!(budget.lowest_ever(), 2);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn budget_rejects_values_above_the_ceiling() {
        record().set_max_tries(RetryClass::WriteOnly, MAX_MAX_TRIES + 1);
    }

    #[test]
    fn histogram_buckets() {
        let mut r = record();
        r.record_attempt(RetryClass::WriteRead, LoopOutcome::Success, 1);
        r.record_attempt(RetryClass::WriteRead, LoopOutcome::Success, 3);
        r.record_attempt(RetryClass::WriteRead, LoopOutcome::RetriesExhausted, 4);
        r.record_attempt(RetryClass::WriteRead, LoopOutcome::AllTriesZero, 4);
        r.record_attempt(RetryClass::WriteRead, LoopOutcome::Fatal, 2);

        let h = r.histogram(RetryClass::WriteRead);
        assert_eq!(h.counts()[0], 1);
        assert_eq!(h.counts()[1], 2);
        assert_eq!(h.counts()[2], 1);
        assert_eq!(h.counts()[4], 1);
        assert_eq!(h.total(), 5);
        assert_eq!(h.highest_non_zero_index(), Some(4));
        assert_eq!(r.total_tries_for_class(RetryClass::WriteRead), 5);
        assert_eq!(r.total_tries_for_class(RetryClass::WriteOnly), 0);
    }

    #[test]
    fn invocation_buffer_overwrites_oldest() {
        let mut buf = InvocationBuffer::default();
        for i in 0..MAX_RECENT_VALUES + 5 {
            buf.push(InvocationRecord {
                epoch_seconds: i as u64,
                try_count: 1,
                required_step: 0,
            });
        }
        assert_eq!(buf.len(), MAX_RECENT_VALUES);
        assert_eq!(buf.get(0).unwrap().epoch_seconds, 5);
        let latest = buf.latest(3);
        assert_eq!(
            latest.iter().map(|r| r.epoch_seconds).collect::<Vec<_>>(),
            vec![22, 23, 24]
        );
    }

    #[test]
    fn from_cache_restores_dsa_state() {
        let cached = CachedDsaState {
            cur_step: 5,
            lookback: 5,
            remaining_interval: 2,
            min_ok_step: 3,
            found_failure_step: true,
            recent: vec![InvocationRecord {
                epoch_seconds: 1_700_000_000,
                try_count: 2,
                required_step: 5,
            }],
        };
        let r = DisplayRecord::from_cache(
            BusPath::new(9),
            0x44,
            cached,
            &RecordDefaults::default(),
        );
        assert_eq!(r.state(), DisplayState::FROM_CACHE);
        assert_eq!(r.cur_step(), 5);
        assert_eq!(r.cur_retry_loop_step(), 5);
        assert_eq!(r.initial_step(), 5);
        assert_eq!(r.initial_lookback(), 5);
        assert_eq!(r.min_ok_step(), 3);
        assert!(r.found_failure_step());
        assert_eq!(r.recent().len(), 1);
    }
}
