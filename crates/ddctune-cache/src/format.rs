//! Line-level parsing and formatting of the stats file.
//!
//! One record per line, whitespace separated:
//!
//! ```text
//! i2c-<busno> <edid_check_hex> <cur_step> <lookback> <remaining_interval> <min_ok_step> <found_failure_step:0|1> {ts,tryct,step}...
//! ```
//!
//! Everything here is pure string work; file I/O and registry interaction
//! live in the crate root.

use ddctune_core::{CachedDsaState, DisplayRecord, InvocationRecord, MAX_RECENT_VALUES};
use ddctune_types::{BusPath, MAX_MAX_TRIES, STEP_LAST};

pub const FORMAT_HEADER: &str = "FORMAT 1";

/// A parsed stats line, not yet a registry record.
#[derive(Debug, Clone)]
pub struct ParsedRecord {
    pub bus: BusPath,
    pub edid_check: u8,
    pub dsa: CachedDsaState,
}

/// Why one line failed to parse. Collected per line so a corrupt file
/// reports every problem at once.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {detail}")]
pub struct LineError {
    pub line: usize,
    pub detail: String,
}

fn bad(line: usize, detail: impl Into<String>) -> LineError {
    LineError {
        line,
        detail: detail.into(),
    }
}

pub fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.is_empty()
        || trimmed.starts_with('#')
        || trimmed.starts_with('*')
        || trimmed.starts_with(';')
}

/// Parse one record line. `line_no` is 1-based, for error reporting.
pub fn parse_record_line(line: &str, line_no: usize) -> Result<ParsedRecord, LineError> {
    let mut fields = line.split_whitespace();

    let bus: BusPath = fields
        .next()
        .ok_or_else(|| bad(line_no, "empty record line"))?
        .parse()
        .map_err(|e| bad(line_no, format!("{e}")))?;

    let edid_check = {
        let field = fields
            .next()
            .ok_or_else(|| bad(line_no, "missing EDID check byte"))?;
        u8::from_str_radix(field, 16)
            .map_err(|_| bad(line_no, format!("bad EDID check byte {field:?}")))?
    };

    let mut int_field = |name: &str| -> Result<usize, LineError> {
        let field = fields
            .next()
            .ok_or_else(|| bad(line_no, format!("missing {name}")))?;
        field
            .parse::<usize>()
            .map_err(|_| bad(line_no, format!("bad {name} {field:?}")))
    };

    let cur_step = int_field("cur_step")?;
    let lookback = int_field("lookback")?;
    let remaining_interval = int_field("remaining_interval")?;
    let min_ok_step = int_field("min_ok_step")?;
    let found_failure_step = match int_field("found_failure_step")? {
        0 => false,
        1 => true,
        other => {
            return Err(bad(
                line_no,
                format!("found_failure_step must be 0 or 1, got {other}"),
            ))
        }
    };

    if cur_step > STEP_LAST {
        return Err(bad(line_no, format!("cur_step {cur_step} out of range")));
    }
    if !(1..=MAX_RECENT_VALUES).contains(&lookback) {
        return Err(bad(line_no, format!("lookback {lookback} out of range")));
    }
    if remaining_interval == 0 {
        return Err(bad(line_no, "remaining_interval must be positive"));
    }
    if min_ok_step > STEP_LAST {
        return Err(bad(
            line_no,
            format!("min_ok_step {min_ok_step} out of range"),
        ));
    }
    if found_failure_step && min_ok_step > cur_step {
        return Err(bad(
            line_no,
            format!("min_ok_step {min_ok_step} above cur_step {cur_step}"),
        ));
    }

    let mut recent = Vec::new();
    for field in fields {
        if recent.len() == MAX_RECENT_VALUES {
            return Err(bad(
                line_no,
                format!("more than {MAX_RECENT_VALUES} invocation records"),
            ));
        }
        recent.push(parse_invocation(field, line_no)?);
    }

    Ok(ParsedRecord {
        bus,
        edid_check,
        dsa: CachedDsaState {
            cur_step,
            lookback,
            remaining_interval: remaining_interval as u32,
            min_ok_step,
            found_failure_step,
            recent,
        },
    })
}

fn parse_invocation(field: &str, line_no: usize) -> Result<InvocationRecord, LineError> {
    let mut parts = field.split(',');
    let mut next = |name: &str| {
        parts
            .next()
            .ok_or_else(|| bad(line_no, format!("invocation record missing {name}: {field:?}")))
    };
    let epoch_seconds = next("timestamp")?
        .parse::<u64>()
        .map_err(|_| bad(line_no, format!("bad invocation timestamp in {field:?}")))?;
    let try_count = next("try count")?
        .parse::<u8>()
        .map_err(|_| bad(line_no, format!("bad invocation try count in {field:?}")))?;
    let required_step = next("step")?
        .parse::<usize>()
        .map_err(|_| bad(line_no, format!("bad invocation step in {field:?}")))?;
    if parts.next().is_some() {
        return Err(bad(line_no, format!("trailing fields in {field:?}")));
    }

    if !(1..=MAX_MAX_TRIES).contains(&try_count) {
        return Err(bad(line_no, format!("try count out of range in {field:?}")));
    }
    if required_step > STEP_LAST {
        return Err(bad(line_no, format!("step out of range in {field:?}")));
    }
    Ok(InvocationRecord {
        epoch_seconds,
        try_count,
        required_step,
    })
}

/// Format one record as a stats line.
pub fn format_record_line(record: &DisplayRecord) -> String {
    let mut line = format!(
        "{} {:02x} {} {} {} {} {}",
        record.bus(),
        record.edid_check(),
        record.cur_step(),
        record.lookback(),
        record.remaining_interval(),
        record.min_ok_step(),
        u8::from(record.found_failure_step()),
    );
    for invocation in record.recent().iter() {
        line.push_str(&format!(
            " {},{},{}",
            invocation.epoch_seconds, invocation.try_count, invocation.required_step
        ));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddctune_core::RecordDefaults;

    #[test]
    fn comments_and_blanks() {
        assert!(is_comment(""));
        assert!(is_comment("   "));
        assert!(is_comment("# note"));
        assert!(is_comment("* generated by ddctune"));
        assert!(is_comment("; stray"));
        assert!(!is_comment("i2c-3 a7 5 5 2 3 1"));
    }

    #[test]
    fn parses_a_full_line() {
        let parsed =
            parse_record_line("i2c-3 a7 5 5 2 3 1 1712000000,1,3 1712000002,2,5", 4).unwrap();
        assert_eq!(parsed.bus, BusPath::new(3));
        assert_eq!(parsed.edid_check, 0xA7);
        assert_eq!(parsed.dsa.cur_step, 5);
        assert_eq!(parsed.dsa.lookback, 5);
        assert_eq!(parsed.dsa.remaining_interval, 2);
        assert_eq!(parsed.dsa.min_ok_step, 3);
        assert!(parsed.dsa.found_failure_step);
        assert_eq!(parsed.dsa.recent.len(), 2);
        assert_eq!(
            parsed.dsa.recent[1],
            InvocationRecord {
                epoch_seconds: 1_712_000_002,
                try_count: 2,
                required_step: 5,
            }
        );
    }

    #[test]
    fn parses_a_line_with_no_history() {
        let parsed = parse_record_line("i2c-11 00 7 5 3 0 0", 2).unwrap();
        assert!(parsed.dsa.recent.is_empty());
        assert!(!parsed.dsa.found_failure_step);
    }

    #[test]
    fn rejects_out_of_range_fields() {
        for (line, needle) in [
            ("i2c-3 a7 11 5 3 0 0", "cur_step"),
            ("i2c-3 a7 5 0 3 0 0", "lookback"),
            ("i2c-3 a7 5 5 0 0 0", "remaining_interval"),
            ("i2c-3 a7 5 5 3 11 0", "min_ok_step"),
            ("i2c-3 a7 5 5 3 7 1", "above cur_step"),
            ("i2c-3 a7 5 5 3 0 2", "found_failure_step"),
            ("i2c-3 zz 5 5 3 0 0", "EDID"),
            ("display-3 a7 5 5 3 0 0", "bus path"),
            ("i2c-3 a7 5 5 3 0 0 100,0,3", "try count"),
            ("i2c-3 a7 5 5 3 0 0 100,1,11", "step out of range"),
            ("i2c-3 a7 5 5 3 0 0 100,1", "missing"),
            ("i2c-3 a7 5 5 3 0 0 100,1,3,9", "trailing"),
            ("i2c-3 a7 5 5 3", "missing min_ok_step"),
        ] {
            let err = parse_record_line(line, 7).unwrap_err();
            assert_eq!(err.line, 7);
            assert!(
                err.detail.contains(needle),
                "line {line:?}: expected {needle:?} in {:?}",
                err.detail
            );
        }
    }

    #[test]
    fn format_parse_round_trip() {
        let mut record = DisplayRecord::new(BusPath::new(5), 0x3C, &RecordDefaults::default());
        record.dsa_on_retryable_failure(2);
        record.dsa_on_final(true, 4, 1_712_000_000);
        record.dsa_on_final(true, 1, 1_712_000_100);

        let line = format_record_line(&record);
        let parsed = parse_record_line(&line, 1).unwrap();
        assert_eq!(parsed.bus, record.bus());
        assert_eq!(parsed.edid_check, record.edid_check());
        assert_eq!(parsed.dsa.cur_step, record.cur_step());
        assert_eq!(parsed.dsa.lookback, record.lookback());
        assert_eq!(parsed.dsa.remaining_interval, record.remaining_interval());
        assert_eq!(parsed.dsa.min_ok_step, record.min_ok_step());
        assert_eq!(parsed.dsa.found_failure_step, record.found_failure_step());
        let restored: Vec<_> = parsed.dsa.recent;
        let original: Vec<_> = record.recent().iter().collect();
        assert_eq!(restored, original);
    }
}
