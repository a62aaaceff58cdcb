//! A simulated flaky monitor.
//!
//! Deterministic stand-in for the raw I²C transport: tests script exact
//! per-attempt outcomes, and the CLI's `simulate` subcommand drives whole
//! engine runs against a seeded random error rate without touching hardware.

use std::collections::{HashMap, VecDeque};

use ddctune_types::{BusPath, EdidSource, Transport, TransportError};

const EIO: i32 = 5;

/// One attempt's scripted outcome.
pub type SimOutcome = Result<Vec<u8>, TransportError>;

struct SimDisplay {
    edid_check: u8,
    /// Response returned by an unscripted, non-failing exchange.
    response: Vec<u8>,
    /// Outcomes consumed front-first before the random model kicks in.
    script: VecDeque<SimOutcome>,
}

/// Handle returned by [`SimTransport::open`].
#[derive(Debug, Clone, Copy)]
pub struct SimHandle {
    bus: BusPath,
    read_only: bool,
}

impl SimHandle {
    pub fn bus(&self) -> BusPath {
        self.bus
    }
}

pub struct SimTransport {
    displays: HashMap<u16, SimDisplay>,
    error_rate: f64,
    rng_state: u64,
    transactions: u64,
}

impl SimTransport {
    pub fn new(seed: u64) -> Self {
        SimTransport {
            displays: HashMap::new(),
            error_rate: 0.0,
            rng_state: seed.max(1),
            transactions: 0,
        }
    }

    /// Probability that an unscripted transaction fails with a retryable
    /// error.
    pub fn with_error_rate(mut self, rate: f64) -> Self {
        assert!((0.0..=1.0).contains(&rate), "error rate {rate} out of range");
        self.error_rate = rate;
        self
    }

    pub fn add_display(&mut self, bus: BusPath, edid_check: u8) {
        self.displays.insert(
            bus.number(),
            SimDisplay {
                edid_check,
                response: vec![0x6E, 0x88, 0x02, 0x00, 0x10, 0x00, 0x00, 0x32],
                script: VecDeque::new(),
            },
        );
    }

    /// Queue an exact outcome for the next unconsumed attempt on `bus`.
    /// Panics if the bus has no simulated display.
    pub fn script(&mut self, bus: BusPath, outcome: SimOutcome) {
        self.displays
            .get_mut(&bus.number())
            .expect("no simulated display on that bus")
            .script
            .push_back(outcome);
    }

    pub fn script_many(&mut self, bus: BusPath, outcomes: impl IntoIterator<Item = SimOutcome>) {
        for outcome in outcomes {
            self.script(bus, outcome);
        }
    }

    /// Transactions attempted so far, scripted and random alike.
    pub fn transactions(&self) -> u64 {
        self.transactions
    }

    // xorshift64*: tiny, seedable, good enough for a failure model.
    fn next_u64(&mut self) -> u64 {
        let mut x = self.rng_state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng_state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn next_unit(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    fn random_failure(&mut self) -> TransportError {
        match self.next_u64() % 4 {
            0 => TransportError::Checksum,
            1 => TransportError::AllZero,
            2 => TransportError::NullResponse,
            _ => TransportError::TransientIo { errno: EIO },
        }
    }

    fn transact(&mut self, bus: BusPath) -> Result<Vec<u8>, TransportError> {
        self.transactions += 1;
        let display = self
            .displays
            .get_mut(&bus.number())
            .ok_or(TransportError::DeviceNotFound)?;
        if let Some(outcome) = display.script.pop_front() {
            return outcome;
        }
        if self.next_unit() < self.error_rate {
            return Err(self.random_failure());
        }
        let response = self
            .displays
            .get(&bus.number())
            .expect("display vanished mid-transaction")
            .response
            .clone();
        Ok(response)
    }
}

impl Transport for SimTransport {
    type Handle = SimHandle;

    fn open(&mut self, bus: BusPath, read_only: bool) -> Result<SimHandle, TransportError> {
        if !self.displays.contains_key(&bus.number()) {
            return Err(TransportError::DeviceNotFound);
        }
        Ok(SimHandle { bus, read_only })
    }

    fn close(&mut self, _handle: SimHandle) -> Result<(), TransportError> {
        Ok(())
    }

    fn write(&mut self, handle: &mut SimHandle, _payload: &[u8]) -> Result<(), TransportError> {
        if handle.read_only {
            return Err(TransportError::PermissionDenied);
        }
        self.transact(handle.bus).map(|_| ())
    }

    fn write_read(
        &mut self,
        handle: &mut SimHandle,
        _request: &[u8],
        expected_len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let mut response = self.transact(handle.bus)?;
        response.truncate(expected_len);
        Ok(response)
    }
}

impl EdidSource for SimTransport {
    fn edid_check_byte(&mut self, bus: BusPath) -> Result<u8, TransportError> {
        self.displays
            .get(&bus.number())
            .map(|d| d.edid_check)
            .ok_or(TransportError::DeviceNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_outcomes_are_consumed_in_order() {
        let mut sim = SimTransport::new(1);
        let bus = BusPath::new(3);
        sim.add_display(bus, 0xA7);
        sim.script_many(
            bus,
            [Err(TransportError::Checksum), Ok(vec![1, 2, 3, 4])],
        );

        let mut handle = sim.open(bus, false).unwrap();
        assert_eq!(
            sim.write_read(&mut handle, &[0], 4),
            Err(TransportError::Checksum)
        );
        assert_eq!(sim.write_read(&mut handle, &[0], 2), Ok(vec![1, 2]));
        assert_eq!(sim.transactions(), 2);
    }

    #[test]
    fn unknown_bus_is_device_not_found() {
        let mut sim = SimTransport::new(1);
        assert_eq!(
            sim.open(BusPath::new(9), false).unwrap_err(),
            TransportError::DeviceNotFound
        );
        assert_eq!(
            sim.edid_check_byte(BusPath::new(9)),
            Err(TransportError::DeviceNotFound)
        );
    }

    #[test]
    fn read_only_handles_reject_writes() {
        let mut sim = SimTransport::new(1);
        let bus = BusPath::new(3);
        sim.add_display(bus, 0);
        let mut handle = sim.open(bus, true).unwrap();
        assert_eq!(
            sim.write(&mut handle, &[1]),
            Err(TransportError::PermissionDenied)
        );
    }

    #[test]
    fn same_seed_same_failures() {
        let run = |seed| {
            let mut sim = SimTransport::new(seed).with_error_rate(0.5);
            let bus = BusPath::new(1);
            sim.add_display(bus, 0);
            let mut handle = sim.open(bus, false).unwrap();
            (0..32)
                .map(|_| sim.write_read(&mut handle, &[0], 8).is_ok())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(42), run(42));
        assert_ne!(run(42), run(43), "different seeds should diverge");
    }
}
