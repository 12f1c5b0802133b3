// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error as DeriveError;

/// Errors surfaced by the Rust-facing [`crate::Region`] API.
///
/// The C ABI (`src/ffi.rs`) never lets one of these cross the boundary as an exception;
/// it flattens each variant back down to the documented sentinel, bool or enum return.
#[derive(Debug, DeriveError, PartialEq, Eq)]
pub enum StmError {
    /// The transaction conflicted with a concurrent committer and was aborted.
    #[error("transaction aborted")]
    Aborted,

    /// The segment table is exhausted (`tag >= MAX_SEGMENTS`).
    #[error("segment table exhausted")]
    AllocExhausted,

    /// A client passed region-creation parameters that violate the contract.
    #[error("invalid region configuration: {reason}")]
    InvalidRegionConfig { reason: &'static str },

    /// A client referenced a segment tag this region never allocated.
    #[error("unknown segment tag {tag}")]
    UnknownSegment { tag: u16 },

    /// `size` or a read/write span was not a positive multiple of the region's alignment.
    #[error("size {size} is not a multiple of alignment {align}")]
    Misaligned { size: u64, align: u64 },
}
