//! The engine context: registry, sleep clock, and tunables bundled into one
//! explicit object passed through every public entry point. There is no
//! process-global state anywhere in the crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ddctune_clock::{HostClock, SleepClock};
use ddctune_types::{BusPath, EdidSource, RetryClass, MAX_MAX_TRIES};

use crate::record::{MultiplierSource, RecordDefaults};
use crate::registry::{RecordHandle, Registry};

/// Initial tunables for a new engine.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Multiplier applied to all protocol base pauses, before DSA scaling.
    pub user_multiplier: f64,
    /// Per-class retry budgets installed on new records, indexed by
    /// [`RetryClass::index`].
    pub default_max_tries: [u8; 4],
    /// Whether the dynamic sleep adaptor starts enabled.
    pub dsa_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            user_multiplier: 1.0,
            default_max_tries: RecordDefaults::default().max_tries,
            dsa_enabled: true,
        }
    }
}

pub struct Engine {
    registry: Registry,
    clock: SleepClock,
    dsa_enabled: AtomicBool,
    defaults: Mutex<RecordDefaults>,
}

impl Engine {
    /// Engine backed by the real monotonic clock.
    pub fn new(config: EngineConfig) -> Self {
        Engine::with_clock(config, SleepClock::real())
    }

    /// Engine with an injected clock; how every timing test is built.
    pub fn with_clock(config: EngineConfig, clock: SleepClock) -> Self {
        assert!(
            config.user_multiplier.is_finite() && config.user_multiplier >= 0.0,
            "user multiplier {} out of range",
            config.user_multiplier
        );
        for n in config.default_max_tries {
            assert!(
                (1..=MAX_MAX_TRIES).contains(&n),
                "default max tries {n} out of range"
            );
        }
        Engine {
            registry: Registry::new(),
            clock,
            dsa_enabled: AtomicBool::new(config.dsa_enabled),
            defaults: Mutex::new(RecordDefaults {
                user_multiplier: config.user_multiplier,
                max_tries: config.default_max_tries,
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn clock(&self) -> &SleepClock {
        &self.clock
    }

    pub(crate) fn epoch_seconds(&self) -> u64 {
        self.clock.host().epoch_seconds()
    }

    pub fn dsa_enabled(&self) -> bool {
        self.dsa_enabled.load(Ordering::Relaxed)
    }

    /// Toggle the DSA at any time. Disabling leaves all learned history in
    /// place; re-enabling picks up where it left off.
    pub fn set_dsa_enabled(&self, enabled: bool) {
        self.dsa_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn record_defaults(&self) -> RecordDefaults {
        *self.defaults.lock().expect("defaults lock poisoned")
    }

    /// Budget installed on records created from now on. Existing records are
    /// untouched.
    pub fn set_default_max_tries(&self, class: RetryClass, n: u8) {
        assert!(
            (1..=MAX_MAX_TRIES).contains(&n),
            "default max tries {n} out of range"
        );
        self.defaults.lock().expect("defaults lock poisoned").max_tries[class.index()] = n;
    }

    pub fn default_max_tries(&self, class: RetryClass) -> u8 {
        self.defaults.lock().expect("defaults lock poisoned").max_tries[class.index()]
    }

    /// Fetch-or-create the record for a live bus whose EDID checksum byte is
    /// known. See [`Registry::get_or_create`] for the verification rules.
    pub fn get_or_create(&self, bus: BusPath, edid_check: u8) -> RecordHandle {
        let defaults = self.record_defaults();
        self.registry.get_or_create(bus, edid_check, &defaults)
    }

    /// Set the retry budget of one class on one existing record. Returns
    /// false if the bus has no record.
    pub fn set_max_tries(&self, bus: BusPath, class: RetryClass, n: u8) -> bool {
        match self.registry.get(bus) {
            Some(handle) => {
                handle
                    .lock()
                    .expect("record lock poisoned")
                    .set_max_tries(class, n);
                true
            }
            None => false,
        }
    }

    /// Explicitly set one display's user multiplier.
    pub fn set_user_multiplier(&self, bus: BusPath, multiplier: f64) -> bool {
        match self.registry.get(bus) {
            Some(handle) => {
                handle
                    .lock()
                    .expect("record lock poisoned")
                    .set_user_multiplier(multiplier, MultiplierSource::Explicit);
                true
            }
            None => false,
        }
    }

    /// The multiplier a retry loop on `bus` would use right now: the DSA
    /// step factor when the adaptor is enabled, the raw user multiplier when
    /// it is not.
    pub fn current_multiplier(&self, bus: BusPath) -> Option<f64> {
        let handle = self.registry.get(bus)?;
        let record = handle.lock().expect("record lock poisoned");
        Some(if self.dsa_enabled() {
            record.dsa_multiplier()
        } else {
            record.user_multiplier()
        })
    }

    /// Reset the learned state of every record and adopt `new_multiplier` as
    /// both their multiplier and the default for records created later.
    pub fn reset_multiplier(&self, new_multiplier: f64) {
        assert!(
            new_multiplier.is_finite() && new_multiplier >= 0.0,
            "user multiplier {new_multiplier} out of range"
        );
        self.defaults
            .lock()
            .expect("defaults lock poisoned")
            .user_multiplier = new_multiplier;
        self.registry.apply_all(|record| record.dsa_reset(new_multiplier));
    }

    /// Hot-reload path for monitor connect/disconnect: re-attach every live
    /// bus (validating identities), then free cache-restored records that
    /// still verified against nothing. Returns the number of buses attached.
    pub fn redetect<S: EdidSource>(&self, identities: &mut S, live_buses: &[BusPath]) -> usize {
        let mut attached = 0;
        for &bus in live_buses {
            match identities.edid_check_byte(bus) {
                Ok(check) => {
                    self.get_or_create(bus, check);
                    attached += 1;
                }
                Err(err) => {
                    tracing::warn!(%bus, error = %err, "cannot read EDID, skipping bus");
                }
            }
        }
        let swept = self.registry.sweep_unverified();
        if swept > 0 {
            tracing::debug!(swept, "freed stale cache records on redetect");
        }
        attached
    }

    /// Host clock handle, for stamping and test control.
    pub fn host(&self) -> &Arc<dyn HostClock> {
        self.clock.host()
    }
}
