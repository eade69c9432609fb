//! Referral and reward ledger.
//!
//! Issues unique referral codes, records referrals with
//! one-referral-per-user semantics, converts a referral to a paid
//! conversion exactly once, and schedules and pays out the resulting
//! rewards through pluggable payout channels. Every multi-row
//! invariant is enforced inside a single store transaction backed by
//! schema-level uniqueness constraints.

pub mod config;
pub mod directory;
pub mod ledger;
pub mod outcome;
pub mod payout;
pub mod registry;
pub mod rewards;
pub mod sweeper;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod test_utils;
