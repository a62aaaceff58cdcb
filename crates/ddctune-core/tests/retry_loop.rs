//! End-to-end retry loop behaviour against the simulated transport, with a
//! fake clock so every sleep is observable.

use std::sync::Arc;
use std::time::Duration;

use ddctune_clock::{FakeHostClock, SleepClock};
use ddctune_core::{Engine, EngineConfig, RecordHandle, SimTransport};
use ddctune_types::{BusPath, DdcError, RetryClass, Transport, TransportError};

const BUS: BusPath = BusPath::new(3);

fn engine_with_fake_clock() -> (Arc<FakeHostClock>, Engine) {
    let host = Arc::new(FakeHostClock::new(0));
    let engine = Engine::with_clock(
        EngineConfig::default(),
        SleepClock::new(host.clone()),
    );
    (host, engine)
}

fn sim_with_display() -> (SimTransport, BusPath) {
    let mut sim = SimTransport::new(7);
    sim.add_display(BUS, 0xA7);
    (sim, BUS)
}

fn attach(engine: &Engine) -> RecordHandle {
    engine.get_or_create(BUS, 0xA7)
}

#[test]
fn clean_exchange_sleeps_once_and_records_success() {
    let (host, engine) = engine_with_fake_clock();
    let (mut sim, bus) = sim_with_display();
    let record = attach(&engine);
    let mut handle = sim.open(bus, false).unwrap();

    let response = engine
        .write_read_with_retry(&mut sim, &mut handle, &record, &[0x01, 0x10], 8)
        .unwrap();
    assert_eq!(response.len(), 8);

    // Base 40ms x user 1.0 x step 1.0 (index 7).
    assert_eq!(host.requested_sleeps(), vec![Duration::from_millis(40)]);
    let r = record.lock().unwrap();
    assert_eq!(r.histogram(RetryClass::WriteRead).counts()[2], 1);
    assert_eq!(r.successful_observations(), 1);
    assert_eq!(r.total_sleep_millis(), 40);
}

#[test]
fn retryable_failures_ramp_the_sleep_then_exhaust() {
    let (host, engine) = engine_with_fake_clock();
    let (mut sim, bus) = sim_with_display();
    let record = attach(&engine);
    let mut handle = sim.open(bus, false).unwrap();

    sim.script_many(bus, (0..4).map(|_| Err(TransportError::Checksum)));

    let err = engine
        .write_read_with_retry(&mut sim, &mut handle, &record, &[0x01, 0x10], 8)
        .unwrap_err();
    assert_eq!(err, DdcError::RetriesExhausted { tries: 4 });

    // Step trajectory inside the loop: 7 -> 8 -> 9 -> 10, so the pauses are
    // 40 x {1.0, 1.3, 1.6, 2.0}.
    assert_eq!(
        host.requested_sleeps(),
        vec![
            Duration::from_millis(40),
            Duration::from_millis(52),
            Duration::from_millis(64),
            Duration::from_millis(80),
        ]
    );

    let r = record.lock().unwrap();
    assert_eq!(r.histogram(RetryClass::WriteRead).counts()[1], 1);
    assert_eq!(r.retryable_failures(), 4);
    // The failed loop abandons its ramp; the next loop starts over.
    assert_eq!(r.cur_retry_loop_step(), r.initial_step());
    assert!(r.recent().is_empty());
}

#[test]
fn zero_filled_responses_every_try_surface_as_all_tries_zero() {
    let (_host, engine) = engine_with_fake_clock();
    let (mut sim, bus) = sim_with_display();
    let record = attach(&engine);
    let mut handle = sim.open(bus, false).unwrap();

    sim.script_many(bus, (0..4).map(|_| Err(TransportError::AllZero)));
    let err = engine
        .write_read_with_retry(&mut sim, &mut handle, &record, &[0x01], 8)
        .unwrap_err();
    assert_eq!(err, DdcError::AllTriesZero { tries: 4 });
    // Still histogram index 1: an exhaustion, not a fatal failure.
    let r = record.lock().unwrap();
    assert_eq!(r.histogram(RetryClass::WriteRead).counts()[1], 1);
}

#[test]
fn mixed_retryable_failures_are_plain_exhaustion() {
    let (_host, engine) = engine_with_fake_clock();
    let (mut sim, bus) = sim_with_display();
    let record = attach(&engine);
    let mut handle = sim.open(bus, false).unwrap();

    sim.script_many(
        bus,
        [
            Err(TransportError::AllZero),
            Err(TransportError::Checksum),
            Err(TransportError::AllZero),
            Err(TransportError::AllZero),
        ],
    );
    let err = engine
        .write_read_with_retry(&mut sim, &mut handle, &record, &[0x01], 8)
        .unwrap_err();
    assert_eq!(err, DdcError::RetriesExhausted { tries: 4 });
}

#[test]
fn fatal_errors_abort_immediately() {
    let (host, engine) = engine_with_fake_clock();
    let (mut sim, bus) = sim_with_display();
    let record = attach(&engine);
    let mut handle = sim.open(bus, false).unwrap();

    sim.script(bus, Err(TransportError::UnsupportedFeature));
    let err = engine
        .write_read_with_retry(&mut sim, &mut handle, &record, &[0x01], 8)
        .unwrap_err();
    assert_eq!(
        err,
        DdcError::Fatal {
            tries: 1,
            source: TransportError::UnsupportedFeature,
        }
    );
    assert_eq!(host.requested_sleeps().len(), 1, "no retry, no second sleep");
    let r = record.lock().unwrap();
    assert_eq!(r.histogram(RetryClass::WriteRead).counts()[0], 1);
}

#[test]
fn success_after_retries_lands_in_the_right_bucket() {
    let (_host, engine) = engine_with_fake_clock();
    let (mut sim, bus) = sim_with_display();
    let record = attach(&engine);
    let mut handle = sim.open(bus, false).unwrap();

    sim.script_many(
        bus,
        [
            Err(TransportError::Checksum),
            Err(TransportError::NullResponse),
            Ok(vec![1, 2, 3, 4, 5, 6, 7, 8]),
        ],
    );
    let response = engine
        .write_read_with_retry(&mut sim, &mut handle, &record, &[0x01], 8)
        .unwrap();
    assert_eq!(response, vec![1, 2, 3, 4, 5, 6, 7, 8]);

    let r = record.lock().unwrap();
    // Success on try 3 -> histogram index 4.
    assert_eq!(r.histogram(RetryClass::WriteRead).counts()[4], 1);
    let invocation = r.recent().get(0).unwrap();
    assert_eq!(invocation.try_count, 3);
    assert_eq!(invocation.required_step, 9, "step after two intra-loop ramps");
}

#[test]
fn disabling_the_dsa_freezes_pacing_and_learning() {
    let (host, engine) = engine_with_fake_clock();
    let (mut sim, bus) = sim_with_display();
    let record = attach(&engine);
    let mut handle = sim.open(bus, false).unwrap();

    engine.set_dsa_enabled(false);
    sim.script_many(
        bus,
        [Err(TransportError::Checksum), Ok(vec![0u8; 8])],
    );
    engine
        .write_read_with_retry(&mut sim, &mut handle, &record, &[0x01], 8)
        .unwrap();

    // User multiplier 1.0 only; the step factor is out of the picture and
    // the ramp never moves.
    assert_eq!(
        host.requested_sleeps(),
        vec![Duration::from_millis(40), Duration::from_millis(40)]
    );
    let r = record.lock().unwrap();
    assert!(r.recent().is_empty(), "no learning while disabled");
    assert_eq!(r.retryable_failures(), 0);
    // The histogram is retry policy, not DSA: it still counts.
    assert_eq!(r.histogram(RetryClass::WriteRead).counts()[3], 1);
}

#[test]
fn write_only_and_multi_part_use_their_own_classes() {
    let (_host, engine) = engine_with_fake_clock();
    let (mut sim, bus) = sim_with_display();
    let record = attach(&engine);
    let mut handle = sim.open(bus, false).unwrap();

    engine
        .write_only_with_retry(&mut sim, &mut handle, &record, &[0x03, 0x10, 0x00, 0x32])
        .unwrap();

    // Two full fragments, then a short final fragment.
    sim.script_many(
        bus,
        [
            Ok(vec![0xAA; 8]),
            Ok(vec![0xBB; 8]),
            Ok(vec![0xCC; 3]),
        ],
    );
    let assembled = engine
        .multi_part_read_with_retry(
            &mut sim,
            &mut handle,
            &record,
            |offset| vec![0xF3, (offset >> 8) as u8, offset as u8],
            8,
        )
        .unwrap();
    assert_eq!(assembled.len(), 19);

    engine
        .multi_part_write_with_retry(
            &mut sim,
            &mut handle,
            &record,
            &[0u8; 20],
            8,
            |offset, chunk| {
                let mut wire = vec![0xE7, (offset >> 8) as u8, offset as u8];
                wire.extend_from_slice(chunk);
                wire
            },
        )
        .unwrap();

    let r = record.lock().unwrap();
    assert_eq!(r.total_tries_for_class(RetryClass::WriteOnly), 1);
    assert_eq!(r.total_tries_for_class(RetryClass::MultiPartRead), 3);
    assert_eq!(r.total_tries_for_class(RetryClass::MultiPartWrite), 3);
    assert_eq!(r.total_tries_for_class(RetryClass::WriteRead), 0);
}

#[test]
fn multi_part_fragment_failure_aborts_the_operation() {
    let (_host, engine) = engine_with_fake_clock();
    let (mut sim, bus) = sim_with_display();
    let record = attach(&engine);
    let mut handle = sim.open(bus, false).unwrap();

    let mut outcomes: Vec<_> = vec![Ok(vec![0xAA; 8])];
    outcomes.extend((0..8).map(|_| Err(TransportError::Checksum)));
    sim.script_many(bus, outcomes);

    let err = engine
        .multi_part_read_with_retry(&mut sim, &mut handle, &record, |_| vec![0xF3], 8)
        .unwrap_err();
    assert_eq!(err, DdcError::RetriesExhausted { tries: 8 });
}
