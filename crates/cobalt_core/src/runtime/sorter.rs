//! Buffer of fixed width tuples sorted with a generated comparator.

use std::mem::{align_of, size_of};
use std::ptr;

use cobalt_error::DbError;
use tracing::debug;

use super::error::set_pending_error;

/// Generated comparator: `(left_tuple, right_tuple) -> i32`, negative when
/// left sorts first.
pub type TupleComparator = unsafe extern "C" fn(*const u8, *const u8) -> i32;

#[repr(C)]
#[derive(Debug)]
pub struct Sorter {
    tuple_size: usize,
    /// Distance between tuples, `tuple_size` rounded up to 8.
    stride: usize,
    /// u64 backing keeps every tuple 8 byte aligned.
    data: Vec<u64>,
    num_tuples: usize,
    live: bool,
}

pub const SORTER_SIZE: usize = size_of::<Sorter>();
pub const SORTER_ALIGN: usize = align_of::<Sorter>();

impl Sorter {
    pub fn new(tuple_size: usize) -> Self {
        Sorter {
            tuple_size,
            stride: tuple_size.max(1).next_multiple_of(8),
            data: Vec::new(),
            num_tuples: 0,
            live: true,
        }
    }

    pub fn num_tuples(&self) -> usize {
        self.num_tuples
    }

    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Reserve space for one more tuple, returning a pointer to its zeroed
    /// bytes.
    ///
    /// Pointers are invalidated by the next call.
    pub fn store_tuple(&mut self) -> *mut u8 {
        let words = self.stride / 8;
        self.data.resize(self.data.len() + words, 0);
        let idx = self.num_tuples;
        self.num_tuples += 1;
        self.tuple_ptr(idx)
    }

    fn tuple_ptr(&self, idx: usize) -> *mut u8 {
        debug_assert!(idx < self.num_tuples);
        // SAFETY: Index checked against number of stored tuples.
        unsafe { (self.data.as_ptr() as *mut u8).add(idx * self.stride) }
    }

    /// Pointer to the first tuple. Tuples are laid out `stride` bytes apart.
    pub fn data(&self) -> *mut u8 {
        self.data.as_ptr() as *mut u8
    }

    /// Stable sort of all tuples using the comparator.
    ///
    /// # Safety
    ///
    /// `cmp` must be safe to call with pointers to any two stored tuples.
    pub unsafe fn sort(&mut self, cmp: TupleComparator) {
        let mut indices: Vec<usize> = (0..self.num_tuples).collect();
        indices.sort_by(|&a, &b| {
            let v = unsafe { cmp(self.tuple_ptr(a), self.tuple_ptr(b)) };
            v.cmp(&0)
        });

        let words = self.stride / 8;
        let mut sorted = Vec::with_capacity(self.data.len());
        for idx in indices {
            sorted.extend_from_slice(&self.data[idx * words..(idx + 1) * words]);
        }
        self.data = sorted;

        debug!(num_tuples = self.num_tuples, "sorted tuples");
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.num_tuples = 0;
    }
}

/// # Safety
///
/// `sorter` must point to `SORTER_SIZE` writable bytes aligned to
/// `SORTER_ALIGN` that don't hold a live sorter.
pub unsafe extern "C" fn rt_sorter_init(sorter: *mut u8, tuple_size: u64) {
    unsafe { (sorter as *mut Sorter).write(Sorter::new(tuple_size as usize)) };
}

/// # Safety
///
/// `sorter` must point to a live sorter.
pub unsafe extern "C" fn rt_sorter_store_tuple(sorter: *mut u8) -> *mut u8 {
    let sorter = unsafe { &mut *(sorter as *mut Sorter) };
    sorter.store_tuple()
}

/// # Safety
///
/// `sorter` must point to a live sorter, `cmp` must be a generated tuple
/// comparator for the sorter's tuple layout.
pub unsafe extern "C" fn rt_sorter_sort(sorter: *mut u8, cmp: *const u8) {
    let sorter = unsafe { &mut *(sorter as *mut Sorter) };
    let cmp: TupleComparator = unsafe { std::mem::transmute(cmp) };
    unsafe { sorter.sort(cmp) };
}

/// # Safety
///
/// `sorter` must point to a live sorter.
pub unsafe extern "C" fn rt_sorter_num_tuples(sorter: *mut u8) -> u64 {
    let sorter = unsafe { &*(sorter as *const Sorter) };
    sorter.num_tuples() as u64
}

/// # Safety
///
/// `sorter` must point to a live sorter.
pub unsafe extern "C" fn rt_sorter_data(sorter: *mut u8) -> *mut u8 {
    let sorter = unsafe { &*(sorter as *const Sorter) };
    sorter.data()
}

/// # Safety
///
/// `sorter` must point to a live sorter.
pub unsafe extern "C" fn rt_sorter_clear(sorter: *mut u8) {
    let sorter = unsafe { &mut *(sorter as *mut Sorter) };
    sorter.clear();
}

/// Tear down variant of `rt_sorter_destroy`. Never raises, sorters that were
/// never initialized are skipped.
///
/// # Safety
///
/// `sorter` must point to a live sorter or zeroed memory.
pub unsafe extern "C" fn rt_sorter_release(sorter: *mut u8) {
    let sorter = sorter as *mut Sorter;
    let live = unsafe { ptr::addr_of!((*sorter).live).read() };
    if live {
        unsafe {
            ptr::drop_in_place(sorter);
            ptr::write_bytes(sorter as *mut u8, 0, SORTER_SIZE);
        }
    }
}

/// # Safety
///
/// `sorter` must point to a live sorter or zeroed memory.
pub unsafe extern "C" fn rt_sorter_destroy(sorter: *mut u8) {
    let sorter = sorter as *mut Sorter;
    let live = unsafe { ptr::addr_of!((*sorter).live).read() };
    if !live {
        set_pending_error(DbError::new("Attempted to destroy sorter that isn't initialized"));
        return;
    }
    unsafe {
        ptr::drop_in_place(sorter);
        ptr::write_bytes(sorter as *mut u8, 0, SORTER_SIZE);
    }
}
