//! Structured per-display and engine-wide reports.
//!
//! The engine emits plain serializable data; choosing a renderer (text,
//! JSON, ...) is the caller's business.

use serde::Serialize;

use ddctune_types::{step_to_multiplier, BusPath, RetryClass};

use crate::engine::Engine;
use crate::record::{DisplayRecord, DisplayState};

/// How much of a record a report includes.
///
/// `Summary` carries the identity and multiplier fields; `Classes` adds the
/// per-class budgets and histograms; `Full` adds the raw invocation buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReportDepth {
    Summary,
    Classes,
    Full,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvocationReport {
    pub epoch_seconds: u64,
    pub try_count: u8,
    pub required_step: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassReport {
    pub class: &'static str,
    pub max_tries: u8,
    pub highest_ever: u8,
    pub lowest_ever: u8,
    pub total_loops: u64,
    /// Histogram counters up to the highest populated index: `[0]` fatal,
    /// `[1]` retries exhausted, `[k >= 2]` success on try `k - 1`.
    pub histogram: Vec<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DisplayReport {
    pub bus: String,
    pub edid_check: u8,
    pub bus_detected: bool,
    pub from_cache: bool,
    pub edid_verified: bool,

    pub user_multiplier: f64,
    pub user_multiplier_source: &'static str,
    /// Multiplier value of the step the record started this run at.
    pub initial_multiplier: f64,
    /// Multiplier value of the current learned resting step.
    pub current_multiplier: f64,
    pub cur_step: usize,
    pub cur_retry_loop_step: usize,
    pub min_ok_step: usize,
    pub found_failure_step: bool,
    pub lookback: usize,
    pub remaining_interval: u32,

    pub total_sleep_millis: u64,
    pub successful_observations: u64,
    pub retryable_failures: u64,
    pub adjustments_up: u64,
    pub adjustments_down: u64,
    pub ok_multiplier_min: Option<f64>,
    pub ok_multiplier_max: Option<f64>,
    pub ok_multiplier_avg: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub classes: Option<Vec<ClassReport>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent: Option<Vec<InvocationReport>>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SleepStatsReport {
    pub total_calls: u64,
    pub requested_millis: u64,
    pub actual_nanos: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineReport {
    pub dsa_enabled: bool,
    pub sleep: SleepStatsReport,
    pub displays: Vec<DisplayReport>,
}

/// Build a report from one record.
pub fn report_record(record: &DisplayRecord, depth: ReportDepth) -> DisplayReport {
    let state = record.state();
    let (min, max, avg) = if record.ok_multiplier_count == 0 {
        (None, None, None)
    } else {
        (
            Some(record.ok_multiplier_min),
            Some(record.ok_multiplier_max),
            Some(record.ok_multiplier_sum / record.ok_multiplier_count as f64),
        )
    };

    let classes = (depth >= ReportDepth::Classes).then(|| {
        RetryClass::ALL
            .iter()
            .map(|&class| {
                let histogram = record.histogram(class);
                let bound = histogram
                    .highest_non_zero_index()
                    .map(|i| i + 1)
                    .unwrap_or(0);
                let budget = record.budget(class);
                ClassReport {
                    class: class.name(),
                    max_tries: budget.current(),
                    highest_ever: budget.highest_ever(),
                    lowest_ever: budget.lowest_ever(),
                    total_loops: histogram.total(),
                    histogram: histogram.counts()[..bound].to_vec(),
                }
            })
            .collect()
    });

    let recent = (depth >= ReportDepth::Full).then(|| {
        record
            .recent()
            .iter()
            .map(|r| InvocationReport {
                epoch_seconds: r.epoch_seconds,
                try_count: r.try_count,
                required_step: r.required_step,
            })
            .collect()
    });

    DisplayReport {
        bus: record.bus().to_string(),
        edid_check: record.edid_check(),
        bus_detected: state.contains(DisplayState::BUS_DETECTED),
        from_cache: state.contains(DisplayState::FROM_CACHE),
        edid_verified: state.contains(DisplayState::EDID_VERIFIED),
        user_multiplier: record.user_multiplier(),
        user_multiplier_source: record.user_multiplier_source().name(),
        initial_multiplier: step_to_multiplier(record.initial_step()),
        current_multiplier: step_to_multiplier(record.cur_step()),
        cur_step: record.cur_step(),
        cur_retry_loop_step: record.cur_retry_loop_step(),
        min_ok_step: record.min_ok_step(),
        found_failure_step: record.found_failure_step(),
        lookback: record.lookback(),
        remaining_interval: record.remaining_interval(),
        total_sleep_millis: record.total_sleep_millis(),
        successful_observations: record.successful_observations(),
        retryable_failures: record.retryable_failures(),
        adjustments_up: record.adjustments_up(),
        adjustments_down: record.adjustments_down(),
        ok_multiplier_min: min,
        ok_multiplier_max: max,
        ok_multiplier_avg: avg,
        classes,
        recent,
    }
}

impl Engine {
    /// Report for one display, if it has a record.
    pub fn report(&self, bus: BusPath, depth: ReportDepth) -> Option<DisplayReport> {
        let handle = self.registry().get(bus)?;
        let record = handle.lock().expect("record lock poisoned");
        Some(report_record(&record, depth))
    }

    /// Engine-wide report: sleep statistics plus every display in ascending
    /// bus order.
    pub fn report_all(&self, depth: ReportDepth) -> EngineReport {
        let mut displays = Vec::new();
        self.registry()
            .apply_all_sorted(|record| displays.push(report_record(record, depth)));
        let sleep = self.clock().stats();
        EngineReport {
            dsa_enabled: self.dsa_enabled(),
            sleep: SleepStatsReport {
                total_calls: sleep.total_calls,
                requested_millis: sleep.requested_millis,
                actual_nanos: sleep.actual_nanos,
            },
            displays,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordDefaults;
    use ddctune_types::LoopOutcome;

    #[test]
    fn depth_controls_nested_sections() {
        let mut record =
            DisplayRecord::new(BusPath::new(4), 0xA7, &RecordDefaults::default());
        record.record_attempt(RetryClass::WriteRead, LoopOutcome::Success, 2);
        record.dsa_on_final(true, 2, 1234);

        let summary = report_record(&record, ReportDepth::Summary);
        assert!(summary.classes.is_none());
        assert!(summary.recent.is_none());
        assert_eq!(summary.bus, "i2c-4");

        let classes = report_record(&record, ReportDepth::Classes);
        let class_reports = classes.classes.unwrap();
        let write_read = &class_reports[RetryClass::WriteRead.index()];
        assert_eq!(write_read.total_loops, 1);
        // Success on try 2 lands at index 3; the vector is truncated there.
        assert_eq!(write_read.histogram, vec![0, 0, 0, 1]);
        assert!(classes.recent.is_none());

        let full = report_record(&record, ReportDepth::Full);
        let recent = full.recent.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].try_count, 2);
        assert_eq!(recent[0].epoch_seconds, 1234);
    }

    #[test]
    fn multiplier_extremes_absent_until_a_success() {
        let record = DisplayRecord::new(BusPath::new(1), 0, &RecordDefaults::default());
        let report = report_record(&record, ReportDepth::Summary);
        assert_eq!(report.ok_multiplier_min, None);
        assert_eq!(report.ok_multiplier_avg, None);
    }
}
