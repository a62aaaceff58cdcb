//! Retry loop drivers: bounded write/read exchanges paced by the sleep clock
//! and fed back into the DSA.
//!
//! Every attempt follows the same strict sequence: read the multiplier in
//! force, sleep the scaled base pause, touch the transport once, then feed
//! the result back. The record's mutex is never held across a sleep or a
//! transport call.

use ddctune_clock::{SleepEvent, SleepOpts};
use ddctune_types::{
    classify, DdcError, ErrorClass, LoopOutcome, RetryClass, Transport, TransportError,
};

use crate::engine::Engine;
use crate::record::DisplayState;
use crate::registry::RecordHandle;

/// Upper bound on an assembled multi-part response. Capability and table
/// reads are bounded by the protocol; anything larger means the display is
/// streaming garbage.
pub const MULTI_PART_MAX_BYTES: usize = 4096;

fn run_retry_loop<R>(
    engine: &Engine,
    record: &RecordHandle,
    class: RetryClass,
    event: SleepEvent,
    mut attempt: impl FnMut() -> Result<R, TransportError>,
) -> Result<R, DdcError> {
    let dsa_enabled = engine.dsa_enabled();
    let max = {
        let r = record.lock().expect("record lock poisoned");
        let state = r.state();
        assert!(
            !(state.contains(DisplayState::FROM_CACHE)
                && !state.contains(DisplayState::EDID_VERIFIED)),
            "cached record for {} used before EDID verification",
            r.bus()
        );
        r.max_tries(class)
    };

    let mut only_zero_failures = true;
    for tryct in 1..=max {
        let (user_multiplier, step_multiplier) = {
            let r = record.lock().expect("record lock poisoned");
            (r.user_multiplier(), r.dsa_multiplier())
        };
        let factor = if dsa_enabled {
            user_multiplier * step_multiplier
        } else {
            user_multiplier
        };
        let millis = (event.base_millis() as f64 * factor).round() as u64;
        engine.clock().sleep(millis, SleepOpts::default(), event);
        record
            .lock()
            .expect("record lock poisoned")
            .note_sleep(millis);

        match attempt() {
            Ok(response) => {
                let mut r = record.lock().expect("record lock poisoned");
                r.record_attempt(class, LoopOutcome::Success, tryct);
                if dsa_enabled {
                    r.dsa_on_final(true, tryct, engine.epoch_seconds());
                }
                return Ok(response);
            }
            Err(err) => match classify(&err) {
                ErrorClass::Retryable => {
                    if !matches!(err, TransportError::AllZero) {
                        only_zero_failures = false;
                    }
                    tracing::trace!(
                        class = class.name(),
                        tryct,
                        max,
                        error = %err,
                        "retryable failure"
                    );
                    if dsa_enabled {
                        record
                            .lock()
                            .expect("record lock poisoned")
                            .dsa_on_retryable_failure(max - tryct);
                    }
                }
                ErrorClass::Fatal => {
                    let mut r = record.lock().expect("record lock poisoned");
                    r.record_attempt(class, LoopOutcome::Fatal, tryct);
                    if dsa_enabled {
                        r.dsa_on_final(false, tryct, engine.epoch_seconds());
                    }
                    return Err(DdcError::Fatal {
                        tries: tryct,
                        source: err,
                    });
                }
            },
        }
    }

    let outcome = if only_zero_failures {
        LoopOutcome::AllTriesZero
    } else {
        LoopOutcome::RetriesExhausted
    };
    let mut r = record.lock().expect("record lock poisoned");
    r.record_attempt(class, outcome, max);
    if dsa_enabled {
        r.dsa_on_final(false, max, engine.epoch_seconds());
    }
    Err(match outcome {
        LoopOutcome::AllTriesZero => DdcError::AllTriesZero { tries: max },
        _ => DdcError::RetriesExhausted { tries: max },
    })
}

impl Engine {
    /// One DDC write-read exchange under the `WriteRead` retry budget.
    pub fn write_read_with_retry<T: Transport>(
        &self,
        transport: &mut T,
        handle: &mut T::Handle,
        record: &RecordHandle,
        request: &[u8],
        expected_len: usize,
    ) -> Result<Vec<u8>, DdcError> {
        run_retry_loop(
            self,
            record,
            RetryClass::WriteRead,
            SleepEvent::WriteToRead,
            || transport.write_read(handle, request, expected_len),
        )
    }

    /// One write-only operation (e.g. Set VCP) under the `WriteOnly` budget.
    pub fn write_only_with_retry<T: Transport>(
        &self,
        transport: &mut T,
        handle: &mut T::Handle,
        record: &RecordHandle,
        payload: &[u8],
    ) -> Result<(), DdcError> {
        run_retry_loop(
            self,
            record,
            RetryClass::WriteOnly,
            SleepEvent::PostWrite,
            || transport.write(handle, payload),
        )
    }

    /// Assemble a multi-part read (capability or table request).
    ///
    /// `fragment_request` builds the request for the fragment starting at
    /// the given byte offset. Each fragment runs under its own
    /// `MultiPartRead` retry loop; a short or empty fragment terminates the
    /// exchange. A fragment failure aborts the whole operation.
    pub fn multi_part_read_with_retry<T: Transport>(
        &self,
        transport: &mut T,
        handle: &mut T::Handle,
        record: &RecordHandle,
        mut fragment_request: impl FnMut(usize) -> Vec<u8>,
        fragment_len: usize,
    ) -> Result<Vec<u8>, DdcError> {
        assert!(fragment_len > 0, "fragment_len must be positive");
        let mut assembled = Vec::new();
        loop {
            if assembled.len() > MULTI_PART_MAX_BYTES {
                return Err(DdcError::Fatal {
                    tries: 0,
                    source: TransportError::ResponseTooLarge {
                        limit: MULTI_PART_MAX_BYTES,
                    },
                });
            }
            let request = fragment_request(assembled.len());
            let fragment = run_retry_loop(
                self,
                record,
                RetryClass::MultiPartRead,
                SleepEvent::MultiPartSegment,
                || transport.write_read(handle, &request, fragment_len),
            )?;
            if fragment.is_empty() {
                return Ok(assembled);
            }
            let done = fragment.len() < fragment_len;
            assembled.extend_from_slice(&fragment);
            if done {
                return Ok(assembled);
            }
        }
    }

    /// Write `payload` in fragments of at most `fragment_len` bytes.
    ///
    /// `frame` wraps each chunk into the on-wire fragment for the given byte
    /// offset. Each fragment runs under its own `MultiPartWrite` retry loop.
    pub fn multi_part_write_with_retry<T: Transport>(
        &self,
        transport: &mut T,
        handle: &mut T::Handle,
        record: &RecordHandle,
        payload: &[u8],
        fragment_len: usize,
        mut frame: impl FnMut(usize, &[u8]) -> Vec<u8>,
    ) -> Result<(), DdcError> {
        assert!(fragment_len > 0, "fragment_len must be positive");
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + fragment_len).min(payload.len());
            let wire = frame(offset, &payload[offset..end]);
            run_retry_loop(
                self,
                record,
                RetryClass::MultiPartWrite,
                SleepEvent::MultiPartSegment,
                || transport.write(handle, &wire),
            )?;
            offset = end;
        }
        Ok(())
    }
}
