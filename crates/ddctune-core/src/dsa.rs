//! The dynamic sleep adaptor: a closed-loop controller on the step ladder.
//!
//! Two feedback paths move the step. Inside a single retry loop,
//! [`next_retry_step`] stretches the multiplier as the remaining try budget
//! shrinks. Across loops, [`DisplayRecord::dsa_on_final`] studies the recent
//! successful-invocation history and nudges the resting step toward the
//! smallest value that still succeeds cleanly. Once a failure boundary has
//! been observed, the controller never relaxes below it (monotone-once),
//! which is what keeps it from oscillating around the edge of reliability.

use ddctune_types::{step_to_multiplier, STEP_COUNT, STEP_LAST};

use crate::record::{DisplayRecord, InvocationRecord, MultiplierSource};

/// A window whose worst success needed more than this many tries, or whose
/// mean try count exceeds 1.4, reads as "high errors" and pushes the step up.
const HIGH_ERROR_MAX_TRYCT: u8 = 3;
const HIGH_ERROR_MEAN_TENTHS: u64 = 14;

/// Step to use on the next iteration of a retry loop after a retryable
/// failure at `prev_step` with `remaining_tries` attempts left.
///
/// The division spreads the remaining ladder over the remaining tries, so the
/// multiplier climbs gently early in the loop and steeply near exhaustion.
/// The clamp of quotients in (0.75, 1.0) up to 1.0 keeps a nearly-due step
/// from being truncated to no movement at all.
pub fn next_retry_step(prev_step: usize, remaining_tries: u8) -> usize {
    assert!(prev_step <= STEP_LAST, "prev_step {prev_step} out of range");
    if remaining_tries == 0 {
        return prev_step;
    }
    let remaining_steps = STEP_COUNT - prev_step;
    let fadj = remaining_steps as f64 / remaining_tries as f64;
    let fadj2 = if fadj > 0.75 && fadj < 1.0 { 1.0 } else { fadj };
    let adjustment = fadj2 as usize;
    (prev_step + adjustment).min(STEP_LAST)
}

impl DisplayRecord {
    /// The step multiplier currently in force for this record's retry loop.
    pub fn dsa_multiplier(&self) -> f64 {
        step_to_multiplier(self.cur_retry_loop_step)
    }

    /// Feed back a retryable failure observed mid-loop. Recomputes the step
    /// for the next iteration of the same loop.
    pub fn dsa_on_retryable_failure(&mut self, remaining_tries: u8) {
        self.retryable_failures += 1;
        let prev = self.cur_retry_loop_step;
        self.cur_retry_loop_step = next_retry_step(prev, remaining_tries);
        if self.cur_retry_loop_step != prev {
            tracing::debug!(
                bus = %self.bus(),
                prev_step = prev,
                next_step = self.cur_retry_loop_step,
                remaining_tries,
                "retryable failure, stretching sleep multiplier"
            );
        }
        self.assert_invariants();
    }

    /// Feed back a finished retry loop.
    ///
    /// On success the invocation is appended to the history and the resting
    /// step may move; on any failure the loop-local ramp is discarded and the
    /// next loop starts over from the record's initial step.
    pub fn dsa_on_final(&mut self, ok: bool, tries: u8, epoch_seconds: u64) {
        if !ok {
            // The loop-local ramp is discarded entirely: the next loop starts
            // over from the initial step (clamped so the loop step never sits
            // below the learned resting step).
            self.remaining_interval = self.adjustment_interval;
            self.cur_retry_loop_step = self.initial_step.max(self.cur_step);
            self.assert_invariants();
            return;
        }

        self.recent.push(InvocationRecord {
            epoch_seconds,
            try_count: tries,
            required_step: self.cur_retry_loop_step,
        });
        self.successful_observations += 1;
        self.note_ok_multiplier(step_to_multiplier(self.cur_retry_loop_step));

        if tries > 3 {
            // The loop had to crank the multiplier hard to get through.
            // Adopt the step that finally worked as the new resting point and
            // remember that a boundary exists below it.
            self.cur_step = self.cur_retry_loop_step;
            self.min_ok_step = self.cur_step;
            self.found_failure_step = true;
            self.adjustments_up += 1;
        } else if tries > 2 {
            self.remaining_interval -= 1;
            if self.remaining_interval == 0 {
                self.adjust_for_recent_successes();
                self.remaining_interval = self.adjustment_interval;
            }
        } else {
            self.adjust_for_recent_successes();
            self.remaining_interval = self.adjustment_interval;
        }

        self.cur_retry_loop_step = self.cur_step;
        self.assert_invariants();
    }

    /// Scan the most recent successes and decide whether the resting step
    /// should move.
    fn adjust_for_recent_successes(&mut self) {
        let window = self.recent.latest(self.lookback.min(self.recent.len()));
        let n = window.len();
        if n == 0 {
            return;
        }
        let max_tryct = window.iter().map(|r| r.try_count).max().unwrap_or(0);
        let total_tryct: u64 = window.iter().map(|r| u64::from(r.try_count)).sum();

        let high_errors = max_tryct > HIGH_ERROR_MAX_TRYCT
            || total_tryct * 10 / n as u64 > HIGH_ERROR_MEAN_TENTHS;

        if high_errors {
            if self.cur_step < STEP_LAST {
                self.cur_step += 1;
                self.adjustments_up += 1;
                self.found_failure_step = true;
                self.min_ok_step = self.cur_step;
                tracing::debug!(
                    bus = %self.bus(),
                    cur_step = self.cur_step,
                    max_tryct,
                    total_tryct,
                    "recent successes too costly, raising step"
                );
            }
        } else if total_tryct <= n as u64 + 1 {
            // Essentially every recent success was a clean single try.
            // Probe downward; the floor follows the step if it would be
            // overtaken.
            self.adjustments_down += 1;
            if self.cur_step > 0 {
                self.cur_step -= 1;
            }
            if self.min_ok_step > self.cur_step {
                self.min_ok_step = self.cur_step;
            }
        } else if self.found_failure_step {
            if self.cur_step > self.min_ok_step {
                self.cur_step -= 1;
                self.adjustments_down += 1;
            }
        } else if self.cur_step > 0 {
            self.cur_step -= 1;
            self.adjustments_down += 1;
        }
    }

    fn note_ok_multiplier(&mut self, multiplier: f64) {
        if self.ok_multiplier_count == 0 {
            self.ok_multiplier_min = multiplier;
            self.ok_multiplier_max = multiplier;
        } else {
            self.ok_multiplier_min = self.ok_multiplier_min.min(multiplier);
            self.ok_multiplier_max = self.ok_multiplier_max.max(multiplier);
        }
        self.ok_multiplier_sum += multiplier;
        self.ok_multiplier_count += 1;
    }

    /// Clear the learned state in place and restart from `new_user_multiplier`.
    pub fn dsa_reset(&mut self, new_user_multiplier: f64) {
        self.set_user_multiplier(new_user_multiplier, MultiplierSource::Reset);
        let initial = ddctune_types::multiplier_to_step(new_user_multiplier);
        self.cur_step = initial;
        self.cur_retry_loop_step = initial;
        self.initial_step = initial;
        self.min_ok_step = 0;
        self.found_failure_step = false;
        self.lookback = self.initial_lookback;
        self.remaining_interval = self.adjustment_interval;
        self.adjustments_up = 0;
        self.adjustments_down = 0;
        self.successful_observations = 0;
        self.retryable_failures = 0;
        self.ok_multiplier_min = 0.0;
        self.ok_multiplier_max = 0.0;
        self.ok_multiplier_sum = 0.0;
        self.ok_multiplier_count = 0;
        self.recent.clear();
        self.assert_invariants();
    }
}
