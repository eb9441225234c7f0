//! Transaction handles: small integer indexes into the slot array.

use std::fmt;

/// Index into the fixed-size slot array, `0 <= index < N_MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    pub const INVALID: Handle = Handle(u32::MAX);

    #[must_use]
    pub const fn from_index(index: usize) -> Self {
        Handle(index as u32)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for Handle {
    fn default() -> Self {
        Handle::INVALID
    }
}
