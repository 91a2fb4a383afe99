use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Identity of a registered service. Also used as a token in the virtual
/// call protocol, so it fits in one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceCode(pub u8);

impl ServiceCode {
    /// Lowest assignable code; `0x00` is the "error" token in the protocol.
    pub const MIN: ServiceCode = ServiceCode(0x01);

    /// Highest assignable code; `0xff` is the "none" token in the protocol.
    pub const MAX: ServiceCode = ServiceCode(0xfe);

    pub fn is_assignable(&self) -> bool {
        *self >= Self::MIN && *self <= Self::MAX
    }
}

impl Display for ServiceCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}
