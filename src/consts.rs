// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Compile-time tunables for the region and its transactions.

/// Upper bound on the number of segments a region may ever hold (tag space is 16 bits,
/// so this can never exceed `1 << 16`).
pub const MAX_SEGMENTS: u32 = 512;

/// Number of bounded CAS attempts a spin-lock acquisition performs before giving up.
pub const SPIN_BOUND: u32 = 100;

/// Number of re-validation attempts the extended read-only path allows before aborting.
pub const RO_VALIDATE_ATTEMPTS: u32 = 10;

/// Initial capacity reserved for a handler's read and write sets.
pub const INIT_SET_CAPACITY: usize = 16;

/// Largest permitted size (in bytes) of the region's initial segment, `2^48`.
pub const MAX_INITIAL_SEGMENT_SIZE: u64 = 1 << 48;
