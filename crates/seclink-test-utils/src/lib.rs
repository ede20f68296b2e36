//! Test helpers for the `seclink` crate: a cleartext re-implementation of
//! the linkage score to verify the oblivious circuit against, and a random
//! input generator for round-trip testing.

pub mod clear;
pub mod random;
