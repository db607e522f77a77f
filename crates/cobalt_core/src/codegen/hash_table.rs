//! Hash table operations emitted inline into generated code.
//!
//! The table itself is the runtime's `HashTable`, which generated code
//! only sees as an opaque blob of `HASH_TABLE_SIZE` bytes. Probing walks the
//! directory with linear probing. Every entry is laid out as
//!
//! ```text
//! [next: 8][hash: 8][packed key][padding to 8][value: value_size]
//! ```
//!
//! with the key packed by `CompactStorage`.

use cobalt_error::Result;
use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{self, Block, InstBuilder};

use super::compact_storage::CompactStorage;
use super::hash::hash_values;
use super::lang::{If, Loop, Vector, VectorizedLoop};
use super::runtime_functions::RuntimeFunction;
use super::types::Type;
use super::value::logical_and_all;
use super::{CodeGen, Value};
use crate::runtime::hash_table::{
    DIRECTORY_OFFSET,
    DIRECTORY_SLOT_SIZE,
    ENTRY_HEADER_SIZE,
    MASK_OFFSET,
    NUM_OCCUPIED_OFFSET,
    SLOT_ENTRY_OFFSET,
    SLOT_HASH_OFFSET,
};

/// Called for an existing entry that matches the probe key.
pub trait ProbeCallback<C> {
    fn process_entry(&mut self, ctx: &mut C, data: ir::Value) -> Result<()>;
}

/// Called to initialize the value region of a newly inserted entry.
pub trait InsertCallback<C> {
    /// Bytes written by `store_value`, at most the table's value size.
    fn value_size(&self) -> usize;

    fn store_value(&mut self, ctx: &mut C, data: ir::Value) -> Result<()>;
}

/// Called once per entry during `iterate`.
pub trait IterateCallback<C> {
    fn process_entry(&mut self, ctx: &mut C, keys: &[Value], data: ir::Value) -> Result<()>;
}

/// Called once per batch during `vectorized_iterate`. `selection` holds
/// `num_selected` directory slot indices, each an occupied slot.
pub trait VectorizedIterateCallback<C> {
    fn process_entries(
        &mut self,
        ctx: &mut C,
        access: &HashTableAccess<'_>,
        selection: &Vector,
        num_selected: ir::Value,
    ) -> Result<()>;
}

/// Outcome of `probe_or_insert`.
#[derive(Debug, Clone, Copy)]
pub struct ProbeResult {
    /// i8 boolean set if the key was already present.
    pub key_exists: ir::Value,
    /// Pointer to the value region of the found or inserted entry.
    pub data_ptr: ir::Value,
}

/// Directory pointer and mask, loaded once per operation.
#[derive(Debug, Clone, Copy)]
pub struct Directory {
    pub slots: ir::Value,
    pub mask: ir::Value,
}

/// Blocks of an emitted probe sequence.
#[derive(Debug, Clone, Copy)]
struct ProbeExits {
    /// Loop header, takes the slot index to probe.
    header: Block,
    /// Key found. Params: entry pointer, slot index.
    found: Block,
    /// Empty slot reached. Param: slot index.
    not_found: Block,
}

/// Random access to directory slots during vectorized iteration.
#[derive(Debug)]
pub struct HashTableAccess<'t> {
    table: &'t HashTable,
    directory: Directory,
}

impl HashTableAccess<'_> {
    /// Entry pointer of an occupied slot.
    pub fn entry(&self, cg: &mut CodeGen, slot_idx: ir::Value) -> ir::Value {
        let slot = self.table.slot_ptr(cg, &self.directory, slot_idx);
        cg.load(ir::types::I64, slot, SLOT_ENTRY_OFFSET as i32)
    }

    pub fn extract_bucket_keys(&self, cg: &mut CodeGen, slot_idx: ir::Value) -> Vec<Value> {
        let entry = self.entry(cg, slot_idx);
        self.table.load_keys(cg, entry)
    }

    pub fn bucket_value(&self, cg: &mut CodeGen, slot_idx: ir::Value) -> ir::Value {
        let entry = self.entry(cg, slot_idx);
        cg.ptr_add(entry, self.table.value_offset as i64)
    }
}

/// Code generator for a hash table with a fixed key schema and value size.
#[derive(Debug, Clone)]
pub struct HashTable {
    key_storage: CompactStorage,
    value_size: usize,
    value_offset: usize,
    entry_size: usize,
}

impl HashTable {
    pub fn new(key_types: &[Type], value_size: usize) -> Self {
        let key_storage = CompactStorage::for_schema(key_types);
        let value_offset = (ENTRY_HEADER_SIZE + key_storage.storage_size()).next_multiple_of(8);
        HashTable {
            key_storage,
            value_size,
            value_offset,
            entry_size: value_offset + value_size,
        }
    }

    pub fn key_types(&self) -> &[Type] {
        self.key_storage.schema()
    }

    pub fn key_storage(&self) -> &CompactStorage {
        &self.key_storage
    }

    pub fn value_size(&self) -> usize {
        self.value_size
    }

    /// Offset of the value region from the start of an entry.
    pub fn value_offset(&self) -> usize {
        self.value_offset
    }

    /// Size of an entry, header included.
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    pub fn init(&self, cg: &mut CodeGen, table: ir::Value, initial_capacity: usize) {
        let entry_size = cg.const64(self.entry_size as i64);
        let capacity = cg.const64(initial_capacity as i64);
        cg.call_runtime_checked(RuntimeFunction::HashTableInit, &[table, entry_size, capacity]);
    }

    pub fn destroy(&self, cg: &mut CodeGen, table: ir::Value) {
        cg.call_runtime_checked(RuntimeFunction::HashTableDestroy, &[table]);
    }

    /// Destroy for tear down. Skips tables that were never initialized and
    /// never raises, so later cleanup still runs.
    pub fn release(&self, cg: &mut CodeGen, table: ir::Value) {
        cg.call_runtime(RuntimeFunction::HashTableRelease, &[table]);
    }

    pub fn hash_key(&self, cg: &mut CodeGen, keys: &[Value]) -> ir::Value {
        hash_values(cg, keys)
    }

    pub fn load_directory(&self, cg: &mut CodeGen, table: ir::Value) -> Directory {
        Directory {
            slots: cg.load(ir::types::I64, table, DIRECTORY_OFFSET as i32),
            mask: cg.load(ir::types::I64, table, MASK_OFFSET as i32),
        }
    }

    /// First directory slot to probe for `hash`.
    pub fn get_entry_by_hash(&self, cg: &mut CodeGen, directory: &Directory, hash: ir::Value) -> ir::Value {
        cg.cursor().ins().band(hash, directory.mask)
    }

    /// Slot following `slot_idx`, wrapping around at the end of the
    /// directory.
    pub fn get_next_entry(&self, cg: &mut CodeGen, directory: &Directory, slot_idx: ir::Value) -> ir::Value {
        let mut pos = cg.cursor();
        let next = pos.ins().iadd_imm(slot_idx, 1);
        pos.ins().band(next, directory.mask)
    }

    fn slot_ptr(&self, cg: &mut CodeGen, directory: &Directory, slot_idx: ir::Value) -> ir::Value {
        cg.ptr_index(directory.slots, slot_idx, DIRECTORY_SLOT_SIZE)
    }

    fn load_keys(&self, cg: &mut CodeGen, entry: ir::Value) -> Vec<Value> {
        let key_area = cg.ptr_add(entry, ENTRY_HEADER_SIZE as i64);
        self.key_storage.load_values(cg, key_area).0
    }

    fn store_keys(&self, cg: &mut CodeGen, entry: ir::Value, keys: &[Value]) {
        let key_area = cg.ptr_add(entry, ENTRY_HEADER_SIZE as i64);
        self.key_storage.store_values(cg, key_area, keys);
    }

    /// Emit the probe loop. Leaves the current block terminated, with
    /// control continuing in one of the returned exits.
    fn emit_probe(&self, cg: &mut CodeGen, directory: &Directory, hash: ir::Value, keys: &[Value]) -> Result<ProbeExits> {
        assert_eq!(self.key_types().len(), keys.len(), "one value per key column");

        let header = cg.create_block_with_params(&[ir::types::I64]);
        let check_hash = cg.create_block();
        let compare_keys = cg.create_block();
        let next = cg.create_block();
        let found = cg.create_block_with_params(&[ir::types::I64, ir::types::I64]);
        let not_found = cg.create_block_with_params(&[ir::types::I64]);

        let start = self.get_entry_by_hash(cg, directory, hash);
        cg.jump(header, &[start]);

        cg.switch_to_block(header);
        let idx = cg.block_params(header)[0];
        let slot = self.slot_ptr(cg, directory, idx);
        let entry = cg.load(ir::types::I64, slot, SLOT_ENTRY_OFFSET as i32);
        let is_empty = cg.cursor().ins().icmp_imm(IntCC::Equal, entry, 0);
        cg.branch_if(is_empty, not_found, &[idx], check_hash, &[]);

        cg.switch_to_block(check_hash);
        let slot_hash = cg.load(ir::types::I64, slot, SLOT_HASH_OFFSET as i32);
        let same_hash = cg.cursor().ins().icmp(IntCC::Equal, slot_hash, hash);
        cg.branch_if(same_hash, compare_keys, &[], next, &[]);

        cg.switch_to_block(compare_keys);
        let stored = self.load_keys(cg, entry);
        let mut matches = Vec::with_capacity(keys.len());
        for (key, stored) in keys.iter().zip(&stored) {
            matches.push(key.test_equality(cg, stored)?);
        }
        let all_match = logical_and_all(cg, &matches);
        cg.branch_if(all_match, found, &[entry, idx], next, &[]);

        cg.switch_to_block(next);
        let next_idx = self.get_next_entry(cg, directory, idx);
        cg.jump(header, &[next_idx]);

        Ok(ProbeExits {
            header,
            found,
            not_found,
        })
    }

    /// Allocate an entry for `hash` and place it in the empty slot
    /// `slot_idx`. Returns the entry pointer.
    fn emit_insert_at(
        &self,
        cg: &mut CodeGen,
        table: ir::Value,
        directory: &Directory,
        slot_idx: ir::Value,
        hash: ir::Value,
        keys: &[Value],
    ) -> ir::Value {
        let entry = cg.call_runtime_value(RuntimeFunction::HashTableAllocEntry, &[table, hash]);
        self.store_keys(cg, entry, keys);

        let slot = self.slot_ptr(cg, directory, slot_idx);
        cg.store(hash, slot, SLOT_HASH_OFFSET as i32);
        cg.store(entry, slot, SLOT_ENTRY_OFFSET as i32);

        let occupied = cg.load(ir::types::I64, table, NUM_OCCUPIED_OFFSET as i32);
        let occupied = cg.cursor().ins().iadd_imm(occupied, 1);
        cg.store(occupied, table, NUM_OCCUPIED_OFFSET as i32);

        entry
    }

    /// Probe for `keys`, inserting a new entry if they're not present.
    ///
    /// The value region of a new entry is zeroed.
    pub fn probe_or_insert(
        &self,
        cg: &mut CodeGen,
        table: ir::Value,
        hash: ir::Value,
        keys: &[Value],
    ) -> Result<ProbeResult> {
        cg.call_runtime_checked(RuntimeFunction::HashTableReserveOne, &[table]);
        let directory = self.load_directory(cg, table);
        let exits = self.emit_probe(cg, &directory, hash, keys)?;
        let merge = cg.create_block_with_params(&[ir::types::I8, ir::types::I64]);

        cg.switch_to_block(exits.found);
        let entry = cg.block_params(exits.found)[0];
        let data = cg.ptr_add(entry, self.value_offset as i64);
        let exists = cg.const_bool(true);
        cg.jump(merge, &[exists, data]);

        cg.switch_to_block(exits.not_found);
        let idx = cg.block_params(exits.not_found)[0];
        let entry = self.emit_insert_at(cg, table, &directory, idx, hash, keys);
        let data = cg.ptr_add(entry, self.value_offset as i64);
        let exists = cg.const_bool(false);
        cg.jump(merge, &[exists, data]);

        cg.switch_to_block(merge);
        let params = cg.block_params(merge);
        Ok(ProbeResult {
            key_exists: params[0],
            data_ptr: params[1],
        })
    }

    /// Callback form of `probe_or_insert`.
    pub fn probe_or_insert_with<'a, C: AsMut<CodeGen<'a>>>(
        &self,
        ctx: &mut C,
        table: ir::Value,
        hash: ir::Value,
        keys: &[Value],
        probe: &mut dyn ProbeCallback<C>,
        insert: &mut dyn InsertCallback<C>,
    ) -> Result<()> {
        assert!(
            insert.value_size() <= self.value_size,
            "insert callback stores more than the value region holds"
        );

        let cg = ctx.as_mut();
        cg.call_runtime_checked(RuntimeFunction::HashTableReserveOne, &[table]);
        let directory = self.load_directory(cg, table);
        let exits = self.emit_probe(cg, &directory, hash, keys)?;
        let merge = cg.create_block();

        cg.switch_to_block(exits.found);
        let entry = cg.block_params(exits.found)[0];
        let data = cg.ptr_add(entry, self.value_offset as i64);
        probe.process_entry(ctx, data)?;
        ctx.as_mut().jump(merge, &[]);

        let cg = ctx.as_mut();
        cg.switch_to_block(exits.not_found);
        let idx = cg.block_params(exits.not_found)[0];
        let entry = self.emit_insert_at(cg, table, &directory, idx, hash, keys);
        let data = cg.ptr_add(entry, self.value_offset as i64);
        insert.store_value(ctx, data)?;
        ctx.as_mut().jump(merge, &[]);

        ctx.as_mut().switch_to_block(merge);
        Ok(())
    }

    /// Insert without checking for an existing key. Returns a pointer to the
    /// new entry's zeroed value region.
    pub fn insert(&self, cg: &mut CodeGen, table: ir::Value, hash: ir::Value, keys: &[Value]) -> ir::Value {
        cg.call_runtime_checked(RuntimeFunction::HashTableReserveOne, &[table]);
        let directory = self.load_directory(cg, table);

        let header = cg.create_block_with_params(&[ir::types::I64]);
        let next = cg.create_block();
        let empty = cg.create_block_with_params(&[ir::types::I64]);

        let start = self.get_entry_by_hash(cg, &directory, hash);
        cg.jump(header, &[start]);

        cg.switch_to_block(header);
        let idx = cg.block_params(header)[0];
        let slot = self.slot_ptr(cg, &directory, idx);
        let entry = cg.load(ir::types::I64, slot, SLOT_ENTRY_OFFSET as i32);
        let is_empty = cg.cursor().ins().icmp_imm(IntCC::Equal, entry, 0);
        cg.branch_if(is_empty, empty, &[idx], next, &[]);

        cg.switch_to_block(next);
        let next_idx = self.get_next_entry(cg, &directory, idx);
        cg.jump(header, &[next_idx]);

        cg.switch_to_block(empty);
        let idx = cg.block_params(empty)[0];
        let entry = self.emit_insert_at(cg, table, &directory, idx, hash, keys);
        cg.ptr_add(entry, self.value_offset as i64)
    }

    /// Invoke `callback` for every entry matching `keys`.
    ///
    /// Probing continues past a match, so duplicate keys are all visited.
    pub fn find_all<'a, C: AsMut<CodeGen<'a>>>(
        &self,
        ctx: &mut C,
        table: ir::Value,
        hash: ir::Value,
        keys: &[Value],
        callback: &mut dyn ProbeCallback<C>,
    ) -> Result<()> {
        let cg = ctx.as_mut();
        let directory = self.load_directory(cg, table);
        let exits = self.emit_probe(cg, &directory, hash, keys)?;
        let done = cg.create_block();

        cg.switch_to_block(exits.not_found);
        cg.jump(done, &[]);

        cg.switch_to_block(exits.found);
        let params = cg.block_params(exits.found);
        let (entry, idx) = (params[0], params[1]);
        let data = cg.ptr_add(entry, self.value_offset as i64);
        callback.process_entry(ctx, data)?;

        let cg = ctx.as_mut();
        let next_idx = self.get_next_entry(cg, &directory, idx);
        cg.jump(exits.header, &[next_idx]);

        cg.switch_to_block(done);
        Ok(())
    }

    /// Invoke `callback` for every entry in the table.
    pub fn iterate<'a, C: AsMut<CodeGen<'a>>>(
        &self,
        ctx: &mut C,
        table: ir::Value,
        callback: &mut dyn IterateCallback<C>,
    ) -> Result<()> {
        let cg = ctx.as_mut();
        let directory = self.load_directory(cg, table);
        let capacity = cg.cursor().ins().iadd_imm(directory.mask, 1);

        // Directory is never empty.
        let start = cg.const64(0);
        let always = cg.const_bool(true);
        let mut slots = Loop::new(cg, always, &[start]);
        let idx = slots.loop_var(cg, 0);

        let slot = self.slot_ptr(cg, &directory, idx);
        let entry = cg.load(ir::types::I64, slot, SLOT_ENTRY_OFFSET as i32);
        let occupied = cg.cursor().ins().icmp_imm(IntCC::NotEqual, entry, 0);
        let mut cond = If::new(cg, occupied);
        {
            let keys = self.load_keys(cg, entry);
            let data = cg.ptr_add(entry, self.value_offset as i64);
            callback.process_entry(ctx, &keys, data)?;
        }
        let cg = ctx.as_mut();
        cond.end_if(cg);

        let next_idx = cg.cursor().ins().iadd_imm(idx, 1);
        let more = cg.cursor().ins().icmp(IntCC::UnsignedLessThan, next_idx, capacity);
        slots.loop_end(cg, more, &[next_idx]);

        Ok(())
    }

    /// Iterate the directory in batches of `vector_size` slots, handing the
    /// callback the occupied slots of each batch.
    pub fn vectorized_iterate<'a, C: AsMut<CodeGen<'a>>>(
        &self,
        ctx: &mut C,
        table: ir::Value,
        vector_size: u32,
        callback: &mut dyn VectorizedIterateCallback<C>,
    ) -> Result<()> {
        let cg = ctx.as_mut();
        let directory = self.load_directory(cg, table);
        let capacity = cg.cursor().ins().iadd_imm(directory.mask, 1);
        let selection = Vector::new(cg, vector_size, "hash_table_selection");

        let mut batches = VectorizedLoop::new(cg, capacity, vector_size, &[]);
        let range = batches.current_range(cg);

        // Fill the selection vector without branching: always write the
        // index, only advance the count for occupied slots.
        let zero = cg.const64(0);
        let always = cg.const_bool(true);
        let mut fill = Loop::new(cg, always, &[range.start, zero]);
        let idx = fill.loop_var(cg, 0);
        let count = fill.loop_var(cg, 1);
        let slot = self.slot_ptr(cg, &directory, idx);
        let entry = cg.load(ir::types::I64, slot, SLOT_ENTRY_OFFSET as i32);
        selection.set_value(cg, count, idx);
        let mut pos = cg.cursor();
        let occupied = pos.ins().icmp_imm(IntCC::NotEqual, entry, 0);
        let occupied = pos.ins().uextend(ir::types::I64, occupied);
        let next_count = pos.ins().iadd(count, occupied);
        let next_idx = pos.ins().iadd_imm(idx, 1);
        let more = pos.ins().icmp(IntCC::SignedLessThan, next_idx, range.end);
        fill.loop_end(cg, more, &[next_idx, next_count]);
        let num_selected = fill.collect_final_loop_vars(cg)[1];

        let access = HashTableAccess {
            table: self,
            directory,
        };
        callback.process_entries(ctx, &access, &selection, num_selected)?;

        batches.loop_end(ctx.as_mut(), &[]);
        Ok(())
    }

    /// Append an entry without probing. Returns a pointer to its value
    /// region. The entry is placed in the directory by `build_lazy` or a
    /// merge.
    pub fn insert_lazy(&self, cg: &mut CodeGen, table: ir::Value, hash: ir::Value, keys: &[Value]) -> ir::Value {
        let entry = cg.call_runtime_value(RuntimeFunction::HashTableInsertLazy, &[table, hash]);
        self.store_keys(cg, entry, keys);
        cg.ptr_add(entry, self.value_offset as i64)
    }

    pub fn build_lazy(&self, cg: &mut CodeGen, table: ir::Value) {
        cg.call_runtime_checked(RuntimeFunction::HashTableBuildLazy, &[table]);
    }

    /// Size `table` for the lazy entries of every thread local table, found
    /// at `offset` in each worker's state in `thread_states`.
    pub fn reserve_lazy(&self, cg: &mut CodeGen, table: ir::Value, thread_states: ir::Value, offset: usize) {
        let offset = cg.const64(offset as i64);
        cg.call_runtime_checked(RuntimeFunction::HashTableReserveLazy, &[table, thread_states, offset]);
    }

    /// Move the lazy entries of `other` into `table`.
    pub fn merge_lazy_unfinished(&self, cg: &mut CodeGen, table: ir::Value, other: ir::Value) {
        cg.call_runtime_checked(RuntimeFunction::HashTableMergeLazyUnfinished, &[table, other]);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::codegen::types::{Registry, TypeId};
    use crate::codegen::{CodeContext, CodegenOptions, FunctionBuilder, FunctionDeclaration, PrimitiveType};
    use crate::runtime::error::take_pending_error;
    use crate::runtime::hash_table::{rt_hash_table_destroy, HASH_TABLE_SIZE};

    /// Adds one to out[0], the key to out[1] and the value to out[2].
    fn accumulate(cg: &mut CodeGen, out: ir::Value, key: &Value, data: ir::Value) {
        let value = cg.load(ir::types::I64, data, 0);
        for (offset, add) in [(0, None), (8, Some(key.value())), (16, Some(value))] {
            let cur = cg.load(ir::types::I64, out, offset);
            let next = match add {
                Some(v) => cg.cursor().ins().iadd(cur, v),
                None => cg.cursor().ins().iadd_imm(cur, 1),
            };
            cg.store(next, out, offset);
        }
    }

    struct SumEntries {
        out: ir::Value,
    }

    impl<'a> IterateCallback<CodeGen<'a>> for SumEntries {
        fn process_entry(&mut self, cg: &mut CodeGen<'a>, keys: &[Value], data: ir::Value) -> Result<()> {
            accumulate(cg, self.out, &keys[0], data);
            Ok(())
        }
    }

    struct SumSelected {
        out: ir::Value,
    }

    impl<'a> VectorizedIterateCallback<CodeGen<'a>> for SumSelected {
        fn process_entries(
            &mut self,
            cg: &mut CodeGen<'a>,
            access: &HashTableAccess<'_>,
            selection: &Vector,
            num_selected: ir::Value,
        ) -> Result<()> {
            let zero = cg.const64(0);
            let any = cg.cursor().ins().icmp_imm(IntCC::SignedGreaterThan, num_selected, 0);
            let mut entries = Loop::new(cg, any, &[zero]);
            let i = entries.loop_var(cg, 0);
            let slot = selection.get_value(cg, i);
            let keys = access.extract_bucket_keys(cg, slot);
            let data = access.bucket_value(cg, slot);
            accumulate(cg, self.out, &keys[0], data);
            let next = cg.cursor().ins().iadd_imm(i, 1);
            let more = cg.cursor().ins().icmp(IntCC::SignedLessThan, next, num_selected);
            entries.loop_end(cg, more, &[next]);
            Ok(())
        }
    }

    struct CountMatches {
        out: ir::Value,
    }

    impl<'a> ProbeCallback<CodeGen<'a>> for CountMatches {
        fn process_entry(&mut self, cg: &mut CodeGen<'a>, _data: ir::Value) -> Result<()> {
            let cur = cg.load(ir::types::I64, self.out, 0);
            let next = cg.cursor().ins().iadd_imm(cur, 1);
            cg.store(next, self.out, 0);
            Ok(())
        }
    }

    /// Adds the probe value to an existing entry's value.
    struct AddToExisting {
        value: ir::Value,
    }

    impl<'a> ProbeCallback<CodeGen<'a>> for AddToExisting {
        fn process_entry(&mut self, cg: &mut CodeGen<'a>, data: ir::Value) -> Result<()> {
            let cur = cg.load(ir::types::I64, data, 0);
            let next = cg.cursor().ins().iadd(cur, self.value);
            cg.store(next, data, 0);
            Ok(())
        }
    }

    struct StoreNew {
        value: ir::Value,
    }

    impl<'a> InsertCallback<CodeGen<'a>> for StoreNew {
        fn value_size(&self) -> usize {
            8
        }

        fn store_value(&mut self, cg: &mut CodeGen<'a>, data: ir::Value) -> Result<()> {
            cg.store(self.value, data, 0);
            Ok(())
        }
    }

    struct Functions {
        init: FunctionDeclaration,
        /// `(table, key, key_null, value) -> exists`, adds value to the
        /// existing value.
        upsert: FunctionDeclaration,
        /// Same as upsert through the callback interface.
        upsert_cb: FunctionDeclaration,
        /// `(table, key, key_null, value)`, allows duplicates.
        insert: FunctionDeclaration,
        insert_lazy: FunctionDeclaration,
        build_lazy: FunctionDeclaration,
        /// `(table, key, key_null, out)`.
        count: FunctionDeclaration,
        /// `(table, out)`.
        sum: FunctionDeclaration,
        vsum: FunctionDeclaration,
    }

    const KEY_ROW: [PrimitiveType; 4] = [
        PrimitiveType::VoidPtr,
        PrimitiveType::Int64,
        PrimitiveType::Bool,
        PrimitiveType::Int64,
    ];

    fn key_arg(cg: &CodeGen, func: &FunctionBuilder) -> Value {
        Value::new(
            Type::nullable(TypeId::BigInt),
            func.argument(cg, 1),
            None,
            Some(func.argument(cg, 2)),
        )
    }

    fn build(cc: &mut CodeContext, registry: &Registry, table: &HashTable) -> Functions {
        let mut cg = CodeGen::new(cc, registry);

        let func = FunctionBuilder::new(&mut cg, "init", &[PrimitiveType::VoidPtr], PrimitiveType::Void).unwrap();
        let ptr = func.argument(&cg, 0);
        table.init(&mut cg, ptr, 4);
        let init = func.return_and_finish(&mut cg, None);

        let func = FunctionBuilder::new(&mut cg, "upsert", &KEY_ROW, PrimitiveType::Bool).unwrap();
        let (ptr, key, value) = (func.argument(&cg, 0), key_arg(&cg, &func), func.argument(&cg, 3));
        let hash = table.hash_key(&mut cg, &[key]);
        let result = table.probe_or_insert(&mut cg, ptr, hash, &[key]).unwrap();
        let cur = cg.load(ir::types::I64, result.data_ptr, 0);
        let next = cg.cursor().ins().iadd(cur, value);
        cg.store(next, result.data_ptr, 0);
        let upsert = func.return_and_finish(&mut cg, Some(result.key_exists));

        let func = FunctionBuilder::new(&mut cg, "upsert_cb", &KEY_ROW, PrimitiveType::Void).unwrap();
        let (ptr, key, value) = (func.argument(&cg, 0), key_arg(&cg, &func), func.argument(&cg, 3));
        let hash = table.hash_key(&mut cg, &[key]);
        table
            .probe_or_insert_with(
                &mut cg,
                ptr,
                hash,
                &[key],
                &mut AddToExisting { value },
                &mut StoreNew { value },
            )
            .unwrap();
        let upsert_cb = func.return_and_finish(&mut cg, None);

        let func = FunctionBuilder::new(&mut cg, "insert", &KEY_ROW, PrimitiveType::Void).unwrap();
        let (ptr, key, value) = (func.argument(&cg, 0), key_arg(&cg, &func), func.argument(&cg, 3));
        let hash = table.hash_key(&mut cg, &[key]);
        let data = table.insert(&mut cg, ptr, hash, &[key]);
        cg.store(value, data, 0);
        let insert = func.return_and_finish(&mut cg, None);

        let func = FunctionBuilder::new(&mut cg, "insert_lazy", &KEY_ROW, PrimitiveType::Void).unwrap();
        let (ptr, key, value) = (func.argument(&cg, 0), key_arg(&cg, &func), func.argument(&cg, 3));
        let hash = table.hash_key(&mut cg, &[key]);
        let data = table.insert_lazy(&mut cg, ptr, hash, &[key]);
        cg.store(value, data, 0);
        let insert_lazy = func.return_and_finish(&mut cg, None);

        let func = FunctionBuilder::new(&mut cg, "build_lazy", &[PrimitiveType::VoidPtr], PrimitiveType::Void).unwrap();
        let ptr = func.argument(&cg, 0);
        table.build_lazy(&mut cg, ptr);
        let build_lazy = func.return_and_finish(&mut cg, None);

        let func = FunctionBuilder::new(&mut cg, "count", &KEY_ROW, PrimitiveType::Void).unwrap();
        let (ptr, key, out) = (func.argument(&cg, 0), key_arg(&cg, &func), func.argument(&cg, 3));
        let hash = table.hash_key(&mut cg, &[key]);
        table
            .find_all(&mut cg, ptr, hash, &[key], &mut CountMatches { out })
            .unwrap();
        let count = func.return_and_finish(&mut cg, None);

        let func = FunctionBuilder::new(
            &mut cg,
            "sum",
            &[PrimitiveType::VoidPtr, PrimitiveType::VoidPtr],
            PrimitiveType::Void,
        )
        .unwrap();
        let (ptr, out) = (func.argument(&cg, 0), func.argument(&cg, 1));
        table.iterate(&mut cg, ptr, &mut SumEntries { out }).unwrap();
        let sum = func.return_and_finish(&mut cg, None);

        let func = FunctionBuilder::new(
            &mut cg,
            "vsum",
            &[PrimitiveType::VoidPtr, PrimitiveType::VoidPtr],
            PrimitiveType::Void,
        )
        .unwrap();
        let (ptr, out) = (func.argument(&cg, 0), func.argument(&cg, 1));
        table
            .vectorized_iterate(&mut cg, ptr, 8, &mut SumSelected { out })
            .unwrap();
        let vsum = func.return_and_finish(&mut cg, None);

        Functions {
            init,
            upsert,
            upsert_cb,
            insert,
            insert_lazy,
            build_lazy,
            count,
            sum,
            vsum,
        }
    }

    type KeyFn = extern "C" fn(*mut u8, i64, u8, i64);

    struct Compiled {
        cc: CodeContext,
        funcs: Functions,
    }

    impl Compiled {
        fn new() -> Self {
            let registry = Registry::new();
            let table = HashTable::new(&[Type::nullable(TypeId::BigInt)], 8);
            let mut cc = CodeContext::try_new(0, CodegenOptions::default()).unwrap();
            let funcs = build(&mut cc, &registry, &table);
            cc.compile().unwrap();
            Compiled { cc, funcs }
        }

        fn ptr(&self, decl: &FunctionDeclaration) -> *const u8 {
            self.cc.get_function_pointer(decl).unwrap()
        }

        fn init(&self, table: &mut [u64]) {
            let f: extern "C" fn(*mut u8) = unsafe { std::mem::transmute(self.ptr(&self.funcs.init)) };
            f(table.as_mut_ptr() as *mut u8);
        }

        fn key_fn(&self, decl: &FunctionDeclaration) -> KeyFn {
            unsafe { std::mem::transmute(self.ptr(decl)) }
        }

        fn sums(&self, table: &mut [u64], vectorized: bool) -> [i64; 3] {
            let decl = if vectorized { &self.funcs.vsum } else { &self.funcs.sum };
            let f: extern "C" fn(*mut u8, *mut i64) = unsafe { std::mem::transmute(self.ptr(decl)) };
            let mut out = [0i64; 3];
            f(table.as_mut_ptr() as *mut u8, out.as_mut_ptr());
            out
        }

        fn count(&self, table: &mut [u64], key: Option<i64>) -> i64 {
            let f = self.key_fn(&self.funcs.count);
            let mut out = 0i64;
            let (k, null) = split(key);
            f(table.as_mut_ptr() as *mut u8, k, null, &mut out as *mut i64 as i64);
            out
        }
    }

    fn split(key: Option<i64>) -> (i64, u8) {
        match key {
            Some(k) => (k, 0),
            None => (0, 1),
        }
    }

    fn new_table() -> Vec<u64> {
        vec![0u64; HASH_TABLE_SIZE.div_ceil(8)]
    }

    fn destroy(table: &mut [u64]) {
        unsafe { rt_hash_table_destroy(table.as_mut_ptr() as *mut u8) };
        assert!(take_pending_error().is_none());
    }

    #[test]
    fn entry_layout() {
        let table = HashTable::new(&[Type::not_null(TypeId::Integer), Type::nullable(TypeId::Varchar)], 12);
        // header 16 + key 17, rounded to 40.
        assert_eq!(40, table.value_offset());
        assert_eq!(52, table.entry_size());
    }

    #[test]
    fn probe_or_insert_matches_model() {
        let compiled = Compiled::new();
        let upsert: extern "C" fn(*mut u8, i64, u8, i64) -> u8 =
            unsafe { std::mem::transmute(compiled.ptr(&compiled.funcs.upsert)) };

        let mut table = new_table();
        compiled.init(&mut table);

        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut model: HashMap<Option<i64>, i64> = HashMap::new();
        for _ in 0..500 {
            let key = if rng.random_bool(0.05) {
                None
            } else {
                Some(rng.random_range(-50..50))
            };
            let value = rng.random_range(0..1000);
            let (k, null) = split(key);

            let exists = upsert(table.as_mut_ptr() as *mut u8, k, null, value);
            assert!(take_pending_error().is_none());
            assert_eq!(model.contains_key(&key), exists == 1, "key {key:?}");
            *model.entry(key).or_default() += value;
        }

        for vectorized in [false, true] {
            let sums = compiled.sums(&mut table, vectorized);
            assert_eq!(model.len() as i64, sums[0]);
            assert_eq!(model.keys().map(|k| k.unwrap_or(0)).sum::<i64>(), sums[1]);
            assert_eq!(model.values().sum::<i64>(), sums[2]);
        }

        for key in model.keys() {
            assert_eq!(1, compiled.count(&mut table, *key));
        }
        assert_eq!(0, compiled.count(&mut table, Some(1000)));

        destroy(&mut table);
    }

    #[test]
    fn callback_upsert_matches_result_upsert() {
        let compiled = Compiled::new();
        let upsert_cb = compiled.key_fn(&compiled.funcs.upsert_cb);

        let mut table = new_table();
        compiled.init(&mut table);

        for (key, value) in [(1, 10), (2, 20), (1, 5), (3, 1), (2, 2)] {
            upsert_cb(table.as_mut_ptr() as *mut u8, key, 0, value);
        }
        assert!(take_pending_error().is_none());

        let sums = compiled.sums(&mut table, false);
        assert_eq!([3, 6, 38], sums);
        destroy(&mut table);
    }

    #[test]
    fn duplicates_found_by_find_all() {
        let compiled = Compiled::new();
        let insert = compiled.key_fn(&compiled.funcs.insert);

        let mut table = new_table();
        compiled.init(&mut table);

        // Enough inserts to force directory growth.
        for i in 0..100 {
            insert(table.as_mut_ptr() as *mut u8, i % 7, 0, i);
        }
        insert(table.as_mut_ptr() as *mut u8, 0, 1, 1);
        insert(table.as_mut_ptr() as *mut u8, 0, 1, 1);
        assert!(take_pending_error().is_none());

        assert_eq!(15, compiled.count(&mut table, Some(0)));
        assert_eq!(14, compiled.count(&mut table, Some(6)));
        assert_eq!(2, compiled.count(&mut table, None));
        assert_eq!(0, compiled.count(&mut table, Some(7)));

        let sums = compiled.sums(&mut table, true);
        assert_eq!(102, sums[0]);
        assert_eq!((0..100).sum::<i64>() + 2, sums[2]);

        destroy(&mut table);
    }

    #[test]
    fn lazy_build_equivalent_to_insert() {
        let compiled = Compiled::new();
        let insert = compiled.key_fn(&compiled.funcs.insert);
        let insert_lazy = compiled.key_fn(&compiled.funcs.insert_lazy);
        let build_lazy: extern "C" fn(*mut u8) = unsafe { std::mem::transmute(compiled.ptr(&compiled.funcs.build_lazy)) };

        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let pairs: Vec<(i64, i64)> = (0..300)
            .map(|_| (rng.random_range(0..40), rng.random_range(0..100)))
            .collect();

        let mut eager = new_table();
        compiled.init(&mut eager);
        let mut lazy = new_table();
        compiled.init(&mut lazy);

        for (k, v) in &pairs {
            insert(eager.as_mut_ptr() as *mut u8, *k, 0, *v);
            insert_lazy(lazy.as_mut_ptr() as *mut u8, *k, 0, *v);
        }
        build_lazy(lazy.as_mut_ptr() as *mut u8);
        assert!(take_pending_error().is_none());

        assert_eq!(compiled.sums(&mut eager, false), compiled.sums(&mut lazy, false));
        assert_eq!(compiled.sums(&mut eager, true), compiled.sums(&mut lazy, true));
        for key in 0..40 {
            assert_eq!(compiled.count(&mut eager, Some(key)), compiled.count(&mut lazy, Some(key)));
        }

        destroy(&mut eager);
        destroy(&mut lazy);
    }
}
