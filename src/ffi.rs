// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The C ABI. Function names and signatures follow the `tm_*` family so that
//! existing client code linking against `libtm` needs no changes beyond pointing
//! its linker at this crate.
//!
//! Every function here is a thin adapter: it turns raw pointers into `&Region`/
//! `&mut Handler`, packs/unpacks [`Address`] at the 64-bit opaque boundary, and
//! never lets a panic unwind across the boundary.

use std::ffi::c_void;

use crate::address::Address;
use crate::region::{AllocResult, Region};
use crate::Handler;

/// Sentinel returned by [`tm_create`] on failure.
pub const INVALID_SHARED: *mut c_void = std::ptr::null_mut();

/// Sentinel returned by [`tm_begin`] on failure.
pub const INVALID_TX: u64 = 0;

/// The `alloc_t` enum: success, allocation failure, or abort.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocT {
    Success = 0,
    Nomem = 1,
    Abort = 2,
}

impl From<AllocResult> for AllocT {
    fn from(r: AllocResult) -> Self {
        match r {
            AllocResult::Success => AllocT::Success,
            AllocResult::Nomem => AllocT::Nomem,
            AllocResult::Abort => AllocT::Abort,
        }
    }
}

unsafe fn region_from_raw<'a>(shared: *mut c_void) -> &'a Region {
    &*(shared as *const Region)
}

/// # Safety
/// `tx` must be a handler previously returned by [`tm_begin`] on this `shared` and
/// not yet passed to [`tm_end`].
unsafe fn handler_from_raw<'a>(tx: u64) -> &'a mut Handler {
    &mut *(tx as *mut Handler)
}

/// Creates a region of `size` bytes with the given alignment. Returns [`INVALID_SHARED`]
/// on failure.
///
/// # Safety
/// The returned pointer must eventually be passed to exactly one [`tm_destroy`] call,
/// and to no other function after that.
#[no_mangle]
pub unsafe extern "C" fn tm_create(size: usize, align: usize) -> *mut c_void {
    match Region::create(size as u64, align as u64) {
        Ok(region) => Box::into_raw(Box::new(region)) as *mut c_void,
        Err(err) => {
            log::error!("tm_create failed: {err}");
            INVALID_SHARED
        }
    }
}

/// Destroys a region created by [`tm_create`].
///
/// # Safety
/// `shared` must be a pointer returned by [`tm_create`], not yet destroyed, with no
/// transaction still in flight against it.
#[no_mangle]
pub unsafe extern "C" fn tm_destroy(shared: *mut c_void) {
    if shared.is_null() {
        return;
    }
    let region = Box::from_raw(shared as *mut Region);
    region.destroy();
}

/// Returns the start address of the region's initial segment.
///
/// # Safety
/// `shared` must be a live pointer returned by [`tm_create`].
#[no_mangle]
pub unsafe extern "C" fn tm_start(shared: *mut c_void) -> u64 {
    region_from_raw(shared).start().encode()
}

/// Returns the size in bytes of the region's initial segment.
///
/// # Safety
/// `shared` must be a live pointer returned by [`tm_create`].
#[no_mangle]
pub unsafe extern "C" fn tm_size(shared: *mut c_void) -> usize {
    region_from_raw(shared).size() as usize
}

/// Returns the region's word alignment in bytes.
///
/// # Safety
/// `shared` must be a live pointer returned by [`tm_create`].
#[no_mangle]
pub unsafe extern "C" fn tm_align(shared: *mut c_void) -> usize {
    region_from_raw(shared).align() as usize
}

/// Begins a transaction. Returns [`INVALID_TX`] on failure; in practice `begin`
/// always succeeds, since only `end` can abort.
///
/// # Safety
/// `shared` must be a live pointer returned by [`tm_create`].
#[no_mangle]
pub unsafe extern "C" fn tm_begin(shared: *mut c_void, is_ro: bool) -> u64 {
    let handler = region_from_raw(shared).begin(is_ro);
    Box::into_raw(Box::new(handler)) as u64
}

/// Ends a transaction, running the commit protocol. Returns whether it committed.
///
/// # Safety
/// `shared` must be a live pointer returned by [`tm_create`]; `tx` must be a value
/// returned by [`tm_begin`] on the same region, not yet ended.
#[no_mangle]
pub unsafe extern "C" fn tm_end(shared: *mut c_void, tx: u64) -> bool {
    let handler = Box::from_raw(tx as *mut Handler);
    region_from_raw(shared).end(*handler)
}

/// Reads `size` bytes starting at the opaque address `source` into `target`.
///
/// # Safety
/// `shared` must be a live region; `tx` a live transaction on it; `source` a valid
/// opaque address previously handed out by this region; `target` must point to at
/// least `size` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn tm_read(shared: *mut c_void, tx: u64, source: u64, size: usize, target: *mut c_void) -> bool {
    let handler = handler_from_raw(tx);
    let dst = std::slice::from_raw_parts_mut(target as *mut u8, size);
    region_from_raw(shared).read(handler, Address::decode(source), size as u64, dst)
}

/// Writes `size` bytes from `source` to the opaque address `target`.
///
/// # Safety
/// `shared` must be a live region; `tx` a live transaction on it; `source` must
/// point to at least `size` readable bytes; `target` a valid opaque address.
#[no_mangle]
pub unsafe extern "C" fn tm_write(shared: *mut c_void, tx: u64, source: *const c_void, size: usize, target: u64) -> bool {
    let handler = handler_from_raw(tx);
    let src = std::slice::from_raw_parts(source as *const u8, size);
    region_from_raw(shared).write(handler, src, size as u64, Address::decode(target))
}

/// Allocates a new segment of `size` bytes, writing its opaque base address to `target`.
///
/// # Safety
/// `shared` must be a live region; `tx` a live transaction on it; `target` must point
/// to a writable `u64`.
#[no_mangle]
pub unsafe extern "C" fn tm_alloc(shared: *mut c_void, _tx: u64, size: usize, target: *mut u64) -> AllocT {
    let mut addr = Address::new(0, 0);
    let result = region_from_raw(shared).alloc(size as u64, &mut addr);
    if result == AllocResult::Success {
        *target = addr.encode();
    }
    result.into()
}

/// Frees the segment at opaque address `target`.
///
/// # Safety
/// `shared` must be a live region; `tx` a live transaction on it; `target` a valid
/// opaque address previously handed out by this region.
#[no_mangle]
pub unsafe extern "C" fn tm_free(shared: *mut c_void, _tx: u64, target: u64) -> bool {
    region_from_raw(shared).free(Address::decode(target))
}
