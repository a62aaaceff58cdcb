use crate::transport::TransportError;

/// Final disposition of a retry loop as seen by callers of the engine.
///
/// Per-try transport errors never cross this boundary; only the loop's
/// outcome does. Cache errors live in the cache crate and are likewise never
/// folded into this type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DdcError {
    /// The retry budget was spent without a successful exchange.
    #[error("retries exhausted after {tries} tries")]
    RetriesExhausted { tries: u8 },

    /// Every attempt produced a zero-filled response. Distinguished from
    /// plain exhaustion because it usually means the display is powered but
    /// its DDC implementation has wedged.
    #[error("all {tries} tries returned zero-filled responses")]
    AllTriesZero { tries: u8 },

    /// A non-retryable transport error aborted the loop.
    #[error("fatal transport error on try {tries}")]
    Fatal {
        tries: u8,
        #[source]
        source: TransportError,
    },
}

impl DdcError {
    /// Tries consumed before the loop gave up.
    pub fn tries(&self) -> u8 {
        match self {
            DdcError::RetriesExhausted { tries }
            | DdcError::AllTriesZero { tries }
            | DdcError::Fatal { tries, .. } => *tries,
        }
    }
}
