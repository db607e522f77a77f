//! Host side of the hash table operated on by generated code.
//!
//! Generated code probes the directory and writes entries directly, reading
//! the handful of fields exported through the `*_OFFSET` constants. Memory
//! management, resizing, and the lazy build/merge paths live here.

use std::mem::{offset_of, size_of};
use std::ptr;

use cobalt_error::{DbError, Result};
use tracing::{debug, trace};

use super::error::set_pending_error;
use super::multi_thread::ThreadStates;

/// A slot in the hash table directory.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DirectorySlot {
    /// Hash of the entry in this slot.
    pub hash: u64,
    /// Pointer to the entry, null if the slot is empty.
    pub entry: *mut u8,
}

impl DirectorySlot {
    const EMPTY: Self = DirectorySlot {
        hash: 0,
        entry: ptr::null_mut(),
    };
}

/// Header at the start of every entry. The packed key immediately follows,
/// then the value region.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EntryHeader {
    /// Intrusive link for lazily inserted entries.
    pub next: *mut u8,
    pub hash: u64,
}

pub const DIRECTORY_SLOT_SIZE: usize = size_of::<DirectorySlot>();
pub const SLOT_HASH_OFFSET: usize = offset_of!(DirectorySlot, hash);
pub const SLOT_ENTRY_OFFSET: usize = offset_of!(DirectorySlot, entry);

pub const ENTRY_HEADER_SIZE: usize = size_of::<EntryHeader>();
pub const ENTRY_NEXT_OFFSET: usize = offset_of!(EntryHeader, next);
pub const ENTRY_HASH_OFFSET: usize = offset_of!(EntryHeader, hash);

pub const HASH_TABLE_SIZE: usize = size_of::<HashTable>();
pub const HASH_TABLE_ALIGN: usize = std::mem::align_of::<HashTable>();
pub const DIRECTORY_OFFSET: usize = offset_of!(HashTable, directory);
pub const MASK_OFFSET: usize = offset_of!(HashTable, mask);
pub const NUM_OCCUPIED_OFFSET: usize = offset_of!(HashTable, num_occupied);

const _: () = {
    assert!(HashTable::MIN_CAPACITY.is_power_of_two(), "must be power of two");
    assert!(DIRECTORY_SLOT_SIZE == 16);
    assert!(ENTRY_HEADER_SIZE == 16);
};

/// Block of entries. Entries never move once allocated.
#[derive(Debug)]
struct EntryBlock {
    /// u64 backing for 8 byte alignment of every entry.
    data: Box<[u64]>,
    /// Number of entries allocated from this block.
    used: usize,
    /// Max number of entries in this block.
    capacity: usize,
}

/// Open addressing hash table with linear probing.
#[repr(C)]
#[derive(Debug)]
pub struct HashTable {
    /// Pointer to the first directory slot. Read by generated code.
    directory: *mut DirectorySlot,
    /// Capacity minus one. Capacity is always a power of two.
    mask: u64,
    /// Number of occupied slots. Updated by generated code on insert.
    num_occupied: u64,
    /// Size in bytes of an entry including the header.
    entry_size: usize,
    /// Distance between entries in a block.
    entry_stride: usize,
    slots: Vec<DirectorySlot>,
    blocks: Vec<EntryBlock>,
    /// Head of the list of lazily inserted entries.
    lazy_head: *mut u8,
    num_lazy: usize,
    /// If this table is initialized and not yet destroyed.
    live: bool,
}

impl HashTable {
    const LOAD_NUM: usize = 7;
    const LOAD_DEN: usize = 10;

    pub const MIN_CAPACITY: usize = 16;

    const MIN_BLOCK_ENTRIES: usize = 64;
    const MAX_BLOCK_ENTRIES: usize = 16 * 1024;

    pub fn new(entry_size: usize, initial_capacity: usize) -> Self {
        assert!(entry_size >= ENTRY_HEADER_SIZE);

        let capacity = initial_capacity.max(Self::MIN_CAPACITY).next_power_of_two();
        let mut slots = vec![DirectorySlot::EMPTY; capacity];

        HashTable {
            directory: slots.as_mut_ptr(),
            mask: (capacity - 1) as u64,
            num_occupied: 0,
            entry_size,
            entry_stride: entry_size.next_multiple_of(8),
            slots,
            blocks: Vec::new(),
            lazy_head: ptr::null_mut(),
            num_lazy: 0,
            live: true,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn num_occupied(&self) -> usize {
        self.num_occupied as usize
    }

    pub fn num_lazy(&self) -> usize {
        self.num_lazy
    }

    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    pub fn needs_resize(&self, num_inputs: usize) -> bool {
        // (num_occupied + num_inputs) / capacity > 7/10
        (self.num_occupied() + num_inputs) * Self::LOAD_DEN > self.capacity() * Self::LOAD_NUM
    }

    /// Make room for at least one more occupied slot, growing the directory
    /// if needed.
    pub fn reserve_one(&mut self) -> Result<()> {
        if self.needs_resize(1) {
            self.resize(self.capacity() * 2)?;
        }
        Ok(())
    }

    /// Resizes the directory to at least `new_capacity`.
    ///
    /// Entries are reinserted using their stored hashes, no key comparisons
    /// needed.
    pub fn resize(&mut self, new_capacity: usize) -> Result<()> {
        let new_capacity = new_capacity
            .checked_next_power_of_two()
            .ok_or_else(|| DbError::new("Requested capacity for hash table too high"))?;
        if new_capacity < self.capacity() {
            return Err(DbError::new("Cannot reduce capacity of hash table")
                .with_field("current", self.capacity())
                .with_field("new", new_capacity));
        }
        if new_capacity == self.capacity() {
            return Ok(());
        }

        trace!(old = self.capacity(), new = new_capacity, "resizing hash table directory");

        let old = std::mem::replace(&mut self.slots, vec![DirectorySlot::EMPTY; new_capacity]);
        self.directory = self.slots.as_mut_ptr();
        self.mask = (new_capacity - 1) as u64;

        for slot in old.iter().filter(|slot| !slot.entry.is_null()) {
            Self::insert_into_slots(&mut self.slots, slot.hash, slot.entry);
        }

        debug_assert_eq!(
            self.num_occupied(),
            self.slots.iter().filter(|s| !s.entry.is_null()).count()
        );

        Ok(())
    }

    /// Place an entry in the first empty slot starting at the slot for its
    /// hash.
    fn insert_into_slots(slots: &mut [DirectorySlot], hash: u64, entry: *mut u8) {
        let cap = slots.len();
        let mut offset = compute_offset_from_hash(hash, cap as u64) as usize;
        loop {
            if slots[offset].entry.is_null() {
                slots[offset] = DirectorySlot { hash, entry };
                return;
            }
            offset = inc_and_wrap_offset(offset, cap);
        }
    }

    /// Allocate an entry, writing its header. The key and value are left for
    /// the caller.
    pub fn alloc_entry(&mut self, hash: u64) -> *mut u8 {
        let needs_block = match self.blocks.last() {
            Some(block) => block.used == block.capacity,
            None => true,
        };
        if needs_block {
            let capacity = match self.blocks.last() {
                Some(block) => (block.capacity * 2).min(Self::MAX_BLOCK_ENTRIES),
                None => Self::MIN_BLOCK_ENTRIES,
            };
            let words = capacity * self.entry_stride / 8;
            self.blocks.push(EntryBlock {
                data: vec![0; words].into_boxed_slice(),
                used: 0,
                capacity,
            });
        }

        let stride = self.entry_stride;
        let Some(block) = self.blocks.last_mut() else {
            unreachable!("entry block pushed above")
        };
        // SAFETY: `used < capacity`, block holds `capacity * stride` bytes.
        let entry = unsafe { (block.data.as_mut_ptr() as *mut u8).add(block.used * stride) };
        block.used += 1;

        // SAFETY: Entry is 8 byte aligned and at least a header wide.
        unsafe {
            (entry as *mut EntryHeader).write(EntryHeader {
                next: ptr::null_mut(),
                hash,
            })
        };

        entry
    }

    /// Allocate an entry and push it onto the lazy list. The directory isn't
    /// touched until `build_lazy`.
    pub fn insert_lazy(&mut self, hash: u64) -> *mut u8 {
        let entry = self.alloc_entry(hash);
        // SAFETY: Entry was just allocated with a header.
        unsafe { (*(entry as *mut EntryHeader)).next = self.lazy_head };
        self.lazy_head = entry;
        self.num_lazy += 1;
        entry
    }

    /// Size the directory so that `additional` more entries fit at no more
    /// than 50% load.
    fn reserve_for_build(&mut self, additional: usize) -> Result<()> {
        let needed = (self.num_occupied() + additional) * 2;
        if needed > self.capacity() {
            self.resize(needed)?;
        }
        Ok(())
    }

    /// Place every lazily inserted entry in the directory.
    pub fn build_lazy(&mut self) -> Result<()> {
        self.reserve_for_build(self.num_lazy)?;

        let mut entry = self.lazy_head;
        let mut count = 0;
        while !entry.is_null() {
            // SAFETY: Lazy list only contains entries allocated by this
            // table (or merged into it).
            let header = unsafe { *(entry as *const EntryHeader) };
            Self::insert_into_slots(&mut self.slots, header.hash, entry);
            count += 1;
            entry = header.next;
        }

        debug_assert_eq!(count, self.num_lazy);
        debug!(entries = count, capacity = self.capacity(), "built hash table");

        self.num_occupied += count as u64;
        self.lazy_head = ptr::null_mut();
        self.num_lazy = 0;

        Ok(())
    }

    /// Size the directory to fit all lazily inserted entries across the
    /// given thread local tables.
    pub fn reserve_lazy<'a>(&mut self, locals: impl IntoIterator<Item = &'a HashTable>) -> Result<()> {
        let total: usize = locals.into_iter().map(|t| t.num_lazy).sum();
        debug!(total, "reserving hash table for merge");
        self.reserve_for_build(total)
    }

    /// Take all lazily inserted entries from `other` and place them in this
    /// table's directory.
    ///
    /// Entry memory is moved into this table, `other` is left empty.
    pub fn merge_lazy_unfinished(&mut self, other: &mut HashTable) -> Result<()> {
        if other.entry_size != self.entry_size {
            return Err(DbError::new("Cannot merge hash tables with different entry sizes")
                .with_field("self", self.entry_size)
                .with_field("other", other.entry_size));
        }

        if self.needs_resize(other.num_lazy) {
            // Caller didn't reserve enough, still correct but slower.
            self.reserve_for_build(other.num_lazy)?;
        }

        let mut entry = other.lazy_head;
        let mut count = 0;
        while !entry.is_null() {
            // SAFETY: See `build_lazy`.
            let header = unsafe { *(entry as *const EntryHeader) };
            Self::insert_into_slots(&mut self.slots, header.hash, entry);
            count += 1;
            entry = header.next;
        }
        debug_assert_eq!(count, other.num_lazy);

        self.num_occupied += count as u64;
        self.blocks.append(&mut other.blocks);
        other.lazy_head = ptr::null_mut();
        other.num_lazy = 0;

        Ok(())
    }

    /// Iterate over all entries placed in the directory.
    pub fn iter_entries(&self) -> impl Iterator<Item = *const u8> + '_ {
        self.slots
            .iter()
            .filter(|slot| !slot.entry.is_null())
            .map(|slot| slot.entry as *const u8)
    }
}

/// Increment offset by one, wrapping around if necessary.
///
/// Requires that `cap` be a power of 2.
pub const fn inc_and_wrap_offset(offset: usize, cap: usize) -> usize {
    (offset + 1) & (cap - 1)
}

/// Compute the initial offset using a hash.
///
/// Requires that `cap` be a power of 2.
pub const fn compute_offset_from_hash(hash: u64, cap: u64) -> u64 {
    hash & (cap - 1)
}

fn report(result: Result<()>) {
    if let Err(e) = result {
        set_pending_error(e);
    }
}

/// # Safety
///
/// `table` must point to `HASH_TABLE_SIZE` writable bytes aligned to
/// `HASH_TABLE_ALIGN` that don't currently hold a live table.
pub unsafe extern "C" fn rt_hash_table_init(table: *mut u8, entry_size: u64, initial_capacity: u64) {
    let table = table as *mut HashTable;
    unsafe { table.write(HashTable::new(entry_size as usize, initial_capacity as usize)) };
}

/// # Safety
///
/// `table` must point to a table initialized with `rt_hash_table_init` or to
/// zeroed memory.
pub unsafe extern "C" fn rt_hash_table_destroy(table: *mut u8) {
    let table = table as *mut HashTable;
    let live = unsafe { ptr::addr_of!((*table).live).read() };
    if !live {
        set_pending_error(DbError::new("Attempted to destroy hash table that isn't initialized"));
        return;
    }
    unsafe {
        ptr::drop_in_place(table);
        ptr::write_bytes(table as *mut u8, 0, HASH_TABLE_SIZE);
    }
}

/// Tear down variant of `rt_hash_table_destroy`. Never raises, tables that
/// were never initialized are skipped.
///
/// # Safety
///
/// `table` must point to a table initialized with `rt_hash_table_init` or to
/// zeroed memory.
pub unsafe extern "C" fn rt_hash_table_release(table: *mut u8) {
    unsafe { destroy_if_live(table as *mut HashTable) };
}

/// Destroy the table if it's live, leaving zeroed memory untouched.
///
/// # Safety
///
/// `table` must point to a table initialized with `rt_hash_table_init` or to
/// zeroed memory.
pub unsafe fn destroy_if_live(table: *mut HashTable) {
    let live = unsafe { ptr::addr_of!((*table).live).read() };
    if live {
        unsafe {
            ptr::drop_in_place(table);
            ptr::write_bytes(table as *mut u8, 0, HASH_TABLE_SIZE);
        }
    }
}

/// # Safety
///
/// `table` must point to a live table.
pub unsafe extern "C" fn rt_hash_table_reserve_one(table: *mut u8) {
    let table = unsafe { &mut *(table as *mut HashTable) };
    report(table.reserve_one());
}

/// # Safety
///
/// `table` must point to a live table.
pub unsafe extern "C" fn rt_hash_table_alloc_entry(table: *mut u8, hash: u64) -> *mut u8 {
    let table = unsafe { &mut *(table as *mut HashTable) };
    table.alloc_entry(hash)
}

/// # Safety
///
/// `table` must point to a live table.
pub unsafe extern "C" fn rt_hash_table_insert_lazy(table: *mut u8, hash: u64) -> *mut u8 {
    let table = unsafe { &mut *(table as *mut HashTable) };
    table.insert_lazy(hash)
}

/// # Safety
///
/// `table` must point to a live table.
pub unsafe extern "C" fn rt_hash_table_build_lazy(table: *mut u8) {
    let table = unsafe { &mut *(table as *mut HashTable) };
    report(table.build_lazy());
}

/// # Safety
///
/// `table` must point to a live table, `thread_states` to live thread states
/// where each worker's state holds a live table at `offset`.
pub unsafe extern "C" fn rt_hash_table_reserve_lazy(table: *mut u8, thread_states: *mut u8, offset: u64) {
    let table = unsafe { &mut *(table as *mut HashTable) };
    let thread_states = unsafe { &*(thread_states as *const ThreadStates) };
    let locals = thread_states
        .iter_states()
        .map(|state| unsafe { &*(state.add(offset as usize) as *const HashTable) });
    report(table.reserve_lazy(locals));
}

/// # Safety
///
/// Both pointers must point to distinct live tables, and the caller must
/// hold exclusive access to `table`.
pub unsafe extern "C" fn rt_hash_table_merge_lazy_unfinished(table: *mut u8, other: *mut u8) {
    let table = unsafe { &mut *(table as *mut HashTable) };
    let other = unsafe { &mut *(other as *mut HashTable) };
    report(table.merge_lazy_unfinished(other));
}
