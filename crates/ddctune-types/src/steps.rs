//! The sleep-multiplier step ladder.
//!
//! Step indices, not floating-point multipliers, are the canonical unit of
//! adjustment: the dynamic sleep adaptor only ever moves up and down this
//! ladder, and persisted state stores indices.

/// Multiplier values in integer hundredths. Index 7 is the 1.0x anchor.
pub const STEPS: [u16; 11] = [0, 5, 10, 20, 30, 50, 70, 100, 130, 160, 200];

pub const STEP_COUNT: usize = STEPS.len();
pub const STEP_LAST: usize = STEP_COUNT - 1;

/// Multiplier value of a step as a float factor.
///
/// Panics on an out-of-range index; step indices are internal state and an
/// out-of-range one is a programmer error, not data.
pub fn step_to_multiplier(step: usize) -> f64 {
    STEPS[step] as f64 / 100.0
}

/// Nearest step for an arbitrary user multiplier, ties toward the lower
/// step. Values above the top of the ladder saturate at [`STEP_LAST`].
pub fn multiplier_to_step(multiplier: f64) -> usize {
    let hundredths = (multiplier * 100.0).round().max(0.0) as u32;
    let mut best = 0;
    let mut best_dist = u32::MAX;
    for (i, &v) in STEPS.iter().enumerate() {
        let dist = (v as u32).abs_diff(hundredths);
        if dist < best_dist {
            best = i;
            best_dist = dist;
        }
    }
    best
}
