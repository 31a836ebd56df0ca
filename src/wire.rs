//! Fixed, little-endian wire records for the rebuild protocol.
//!
//! Wire conventions:
//! - All integers are LE fixed width (u32 counts/attribute codes, u64 ids).
//! - Records are `#[repr(C)]` and bytemuck::Pod-safe; no `#[repr(packed)]`.
//! - Receive buffers are plain byte vectors with no alignment guarantee;
//!   decoding goes through [`read_pod`], which tolerates unaligned input.

use bytemuck::{Pod, Zeroable};
use std::mem::size_of;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

/// Decode one `T` from `bytes` (exactly `size_of::<T>()` long, any alignment).
#[inline]
pub fn read_pod<T: Pod>(bytes: &[u8]) -> T {
    bytemuck::pod_read_unaligned(bytes)
}

/// Encode `value` into `buf` (exactly `size_of::<T>()` long, any alignment).
#[inline]
pub fn write_pod<T: Pod>(buf: &mut [u8], value: &T) {
    buf.copy_from_slice(bytemuck::bytes_of(value));
}

/// Sizes-phase frame of the rebuild: how many records of each stream follow
/// in the data phase.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireCounts {
    source_le: u32,
    target_le: u32,
}

impl WireCounts {
    pub fn new(source: usize, target: usize) -> Self {
        Self {
            source_le: (source as u32).to_le(),
            target_le: (target as u32).to_le(),
        }
    }
    pub fn source(&self) -> usize {
        u32::from_le(self.source_le) as usize
    }
    pub fn target(&self) -> usize {
        u32::from_le(self.target_le) as usize
    }
}

/// One public index-set entry on the wire: `(global id, attribute code)`.
///
/// Local positions are never transmitted; both endpoints recover the pairing
/// from the shared global order.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireIndexRecord {
    global_le: u64,
    attribute_le: u32,
    _pad: u32,
}

impl WireIndexRecord {
    pub fn new(global: u64, attribute: u32) -> Self {
        Self {
            global_le: global.to_le(),
            attribute_le: attribute.to_le(),
            _pad: 0,
        }
    }
    pub fn global(&self) -> u64 {
        u64::from_le(self.global_le)
    }
    pub fn attribute(&self) -> u32 {
        u32::from_le(self.attribute_le)
    }
}

pub const COUNTS_SIZE: usize = 8;
pub const INDEX_RECORD_SIZE: usize = 16;

const _: () = {
    // Pod/Zeroable ensures no padding contains uninit when cast to bytes.
    assert!(size_of::<WireCounts>() == COUNTS_SIZE);
    assert!(size_of::<WireIndexRecord>() == INDEX_RECORD_SIZE);
};
