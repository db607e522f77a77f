//! String helpers called from generated code.

use ahash::RandomState;

/// Fixed seeds so string hashes agree across threads and hash tables.
const HASH_SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

fn hasher() -> RandomState {
    RandomState::with_seeds(HASH_SEEDS[0], HASH_SEEDS[1], HASH_SEEDS[2], HASH_SEEDS[3])
}

pub fn hash_bytes(bytes: &[u8]) -> u64 {
    hasher().hash_one(bytes)
}

/// Returns a slice for a possibly null pointer with zero length.
///
/// # Safety
///
/// If `len` is non-zero, `ptr` must point to `len` readable bytes.
unsafe fn as_slice<'a>(ptr: *const u8, len: u32) -> &'a [u8] {
    if len == 0 {
        return &[];
    }
    unsafe { std::slice::from_raw_parts(ptr, len as usize) }
}

/// # Safety
///
/// See `as_slice`.
pub unsafe extern "C" fn rt_hash_bytes(ptr: *const u8, len: u32) -> u64 {
    hash_bytes(unsafe { as_slice(ptr, len) })
}

/// Byte-wise comparison, a shorter prefix sorts first.
///
/// # Safety
///
/// See `as_slice`.
pub unsafe extern "C" fn rt_compare_strings(left: *const u8, left_len: u32, right: *const u8, right_len: u32) -> i32 {
    let left = unsafe { as_slice(left, left_len) };
    let right = unsafe { as_slice(right, right_len) };
    left.cmp(right) as i32
}
