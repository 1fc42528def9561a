//! Priority tiers.

use serde::{Deserialize, Serialize};

/// Priority class of a work item; `0` is the most urgent.
///
/// Tiers are stamped on items by domain logic outside the scheduler. The
/// scheduler only reads them to decide which items are due in a cycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tier(pub u8);

impl Tier {
    /// The urgency tier, due on every cycle.
    pub const URGENT: Tier = Tier(0);

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn is_urgent(self) -> bool {
        self == Self::URGENT
    }
}

impl core::fmt::Display for Tier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for Tier {
    fn from(value: u8) -> Self {
        Self(value)
    }
}
