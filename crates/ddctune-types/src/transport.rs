use crate::bus::BusPath;

// Errno values the classifier cares about, spelled out so the crate does not
// drag in libc for three integers.
const EIO: i32 = 5;
const ENXIO: i32 = 6;
const EACCES: i32 = 13;
const ENODEV: i32 = 19;
const EPERM: i32 = 1;

/// Errors a transport implementation may surface to the engine.
///
/// The variants are deliberately fine-grained on the retryable side: the DDC
/// protocol fails in recognisably different ways (bad checksum, a zero-filled
/// packet, no packet at all) and per-variant counts are useful when tuning a
/// misbehaving display.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("response checksum invalid")]
    Checksum,
    #[error("response contained only zero bytes")]
    AllZero,
    #[error("null response (display had nothing to say)")]
    NullResponse,
    #[error("transient i/o failure (errno {errno})")]
    TransientIo { errno: i32 },
    #[error("i/o failure (errno {errno})")]
    FatalIo { errno: i32 },
    #[error("no DDC-capable device on the bus")]
    DeviceNotFound,
    #[error("permission denied opening the bus device")]
    PermissionDenied,
    #[error("feature unsupported or disabled by the display")]
    UnsupportedFeature,
    #[error("multi-part response exceeded {limit} bytes")]
    ResponseTooLarge { limit: usize },
}

impl TransportError {
    /// Map a raw OS errno from an I²C ioctl into the taxonomy. `EIO` and
    /// `ENXIO` are the two errnos flaky monitors produce routinely and are
    /// therefore retryable.
    pub fn from_errno(errno: i32) -> TransportError {
        match errno {
            EIO | ENXIO => TransportError::TransientIo { errno },
            EACCES | EPERM => TransportError::PermissionDenied,
            ENODEV => TransportError::DeviceNotFound,
            other => TransportError::FatalIo { errno: other },
        }
    }
}

/// How the retry loop should react to a failed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

/// Classify a transport error. Pure; consulted both by the retry loop (to
/// decide continuation) and by the retry policy (to pick a histogram bucket).
pub const fn classify(err: &TransportError) -> ErrorClass {
    match err {
        TransportError::Checksum
        | TransportError::AllZero
        | TransportError::NullResponse
        | TransportError::TransientIo { .. } => ErrorClass::Retryable,
        TransportError::FatalIo { .. }
        | TransportError::DeviceNotFound
        | TransportError::PermissionDenied
        | TransportError::UnsupportedFeature
        | TransportError::ResponseTooLarge { .. } => ErrorClass::Fatal,
    }
}

/// Raw byte transport the engine drives. Implementations own the actual I²C
/// plumbing; the engine owns pacing and retries.
pub trait Transport {
    type Handle;

    fn open(&mut self, bus: BusPath, read_only: bool) -> Result<Self::Handle, TransportError>;

    fn close(&mut self, handle: Self::Handle) -> Result<(), TransportError>;

    fn write(&mut self, handle: &mut Self::Handle, payload: &[u8]) -> Result<(), TransportError>;

    /// One write-read exchange. `expected_len` is the response length the
    /// protocol layer predicts; transports may return fewer bytes (a short
    /// final fragment) but never more.
    fn write_read(
        &mut self,
        handle: &mut Self::Handle,
        request: &[u8],
        expected_len: usize,
    ) -> Result<Vec<u8>, TransportError>;
}

/// Identity source used to validate cached per-display state: the checksum
/// byte (index 127) of the base EDID block of whatever monitor is currently
/// on the bus.
pub trait EdidSource {
    fn edid_check_byte(&mut self, bus: BusPath) -> Result<u8, TransportError>;
}
