//! Two-phase operation outcome: a primary fact that has been durably
//! committed, plus the result of a best-effort secondary write that
//! happened after the commit and must never roll it back.

use std::fmt::Display;

/// Result of a best-effort write performed after the primary
/// transaction committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecondaryEffect {
    Applied,
    Failed(String),
}

impl SecondaryEffect {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// A committed primary value together with the fate of its secondary
/// effect. Callers may rely on `value` regardless of `secondary`.
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: T,
    pub secondary: SecondaryEffect,
}

impl<T> Outcome<T> {
    pub fn applied(value: T) -> Self {
        Self {
            value,
            secondary: SecondaryEffect::Applied,
        }
    }

    pub fn degraded(value: T, error: impl Display) -> Self {
        Self {
            value,
            secondary: SecondaryEffect::Failed(error.to_string()),
        }
    }
}
