// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Word-granular software transactional memory
//!
//! A TL2-style software transactional memory over a region of word-aligned shared
//! memory. A global clock and one versioned lock per word let disjoint read-write
//! transactions commit without blocking each other; conflicting ones abort and the
//! caller retries.
//!
//! [`Region`] is the library surface: create one, [`Region::begin`] transactions
//! against it, [`Region::read`]/[`Region::write`] through a [`Handler`], and
//! [`Region::end`] to attempt commit. [`mod@ffi`] exposes the same operations as a
//! C ABI for clients that can only link against a `tm_`-prefixed shared object.

pub mod address;
pub mod consts;
pub mod error;
pub mod ffi;
pub mod handler;
pub mod region;
pub mod segment;
pub mod vlock;

pub use address::Address;
pub use error::StmError;
pub use handler::Handler;
pub use region::{AllocResult, Region};
