use std::fmt;
use std::str::FromStr;

/// Identifies the I²C bus a display is attached to.
///
/// Currently a single bus number (`/dev/i2c-N`); kept as a newtype so the
/// addressing scheme can grow without disturbing the registry key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusPath(u16);

impl BusPath {
    pub const fn new(busno: u16) -> Self {
        BusPath(busno)
    }

    pub const fn number(self) -> u16 {
        self.0
    }

    /// Stable integer used as the per-display registry key.
    pub const fn key(self) -> u64 {
        self.0 as u64
    }
}

impl fmt::Display for BusPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i2c-{}", self.0)
    }
}

impl FromStr for BusPath {
    type Err = BusPathParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("i2c-").unwrap_or(s);
        digits
            .parse::<u16>()
            .map(BusPath)
            .map_err(|_| BusPathParseError {
                input: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid bus path {input:?}, expected \"i2c-<n>\" or a bare bus number")]
pub struct BusPathParseError {
    pub input: String,
}
