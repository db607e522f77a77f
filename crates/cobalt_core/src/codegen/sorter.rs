//! Code generation over the runtime `Sorter`.
//!
//! Tuples are stored in compact storage format. Sorting calls back into a
//! generated comparator built from the sort keys.

use cobalt_error::Result;
use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{self, InstBuilder};

use super::compact_storage::CompactStorage;
use super::lang::Loop;
use super::runtime_functions::RuntimeFunction;
use super::types::Type;
use super::{CodeGen, FunctionBuilder, FunctionDeclaration, PrimitiveType, Value};

/// A column to sort on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortColumn {
    /// Index into the tuple schema.
    pub index: usize,
    pub descending: bool,
}

/// Called once per tuple during iteration.
pub trait SorterIterateCallback<C> {
    fn process_tuple(&mut self, ctx: &mut C, values: &[Value]) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct Sorter {
    storage: CompactStorage,
}

impl Sorter {
    pub fn new(schema: &[Type]) -> Self {
        Sorter {
            storage: CompactStorage::for_schema(schema),
        }
    }

    pub fn storage(&self) -> &CompactStorage {
        &self.storage
    }

    pub fn tuple_size(&self) -> usize {
        self.storage.storage_size()
    }

    /// Distance between tuples in the runtime buffer.
    pub fn stride(&self) -> usize {
        self.tuple_size().max(1).next_multiple_of(8)
    }

    pub fn init(&self, cg: &mut CodeGen, sorter: ir::Value) {
        let size = cg.const64(self.tuple_size() as i64);
        cg.call_runtime_checked(RuntimeFunction::SorterInit, &[sorter, size]);
    }

    /// Append a tuple.
    pub fn store_tuple(&self, cg: &mut CodeGen, sorter: ir::Value, values: &[Value]) {
        let space = cg.call_runtime_value(RuntimeFunction::SorterStoreTuple, &[sorter]);
        self.storage.store_values(cg, space, values);
    }

    /// Generate the comparator `(left, right) -> i32` for `columns`, first
    /// column most significant. NULLs sort last ascending, first descending.
    ///
    /// Built as a separate function, may be called while another function
    /// is under construction.
    pub fn build_comparator(&self, cg: &mut CodeGen, name: &str, columns: &[SortColumn]) -> Result<FunctionDeclaration> {
        let func = FunctionBuilder::new(
            cg,
            name,
            &[PrimitiveType::VoidPtr, PrimitiveType::VoidPtr],
            PrimitiveType::Int32,
        )?;
        let left = func.argument(cg, 0);
        let right = func.argument(cg, 1);
        let (left, _) = self.storage.load_values(cg, left);
        let (right, _) = self.storage.load_values(cg, right);

        let mut result = cg.const32(0);
        // Least significant first, each more significant column overrides
        // when it isn't equal.
        for column in columns.iter().rev() {
            let mut cmp = left[column.index].compare_for_sort(cg, &right[column.index])?;
            if column.descending {
                cmp = cg.cursor().ins().ineg(cmp);
            }
            let mut pos = cg.cursor();
            let is_eq = pos.ins().icmp_imm(IntCC::Equal, cmp, 0);
            result = pos.ins().select(is_eq, result, cmp);
        }

        Ok(func.return_and_finish(cg, Some(result)))
    }

    pub fn sort(&self, cg: &mut CodeGen, sorter: ir::Value, comparator: &FunctionDeclaration) {
        let cmp = cg.func_addr(comparator);
        cg.call_runtime_checked(RuntimeFunction::SorterSort, &[sorter, cmp]);
    }

    pub fn num_tuples(&self, cg: &mut CodeGen, sorter: ir::Value) -> ir::Value {
        cg.call_runtime_value(RuntimeFunction::SorterNumTuples, &[sorter])
    }

    /// Invoke `callback` for every tuple in sorted (or insertion) order.
    pub fn iterate<'a, C: AsMut<CodeGen<'a>>>(
        &self,
        ctx: &mut C,
        sorter: ir::Value,
        callback: &mut dyn SorterIterateCallback<C>,
    ) -> Result<()> {
        let cg = ctx.as_mut();
        let num = self.num_tuples(cg, sorter);
        let data = cg.call_runtime_value(RuntimeFunction::SorterData, &[sorter]);

        let zero = cg.const64(0);
        let any = cg.cursor().ins().icmp_imm(IntCC::SignedGreaterThan, num, 0);
        let mut tuples = Loop::new(cg, any, &[zero]);
        let idx = tuples.loop_var(cg, 0);
        let tuple = cg.ptr_index(data, idx, self.stride());
        let (values, _) = self.storage.load_values(cg, tuple);
        callback.process_tuple(ctx, &values)?;

        let cg = ctx.as_mut();
        let next = cg.cursor().ins().iadd_imm(idx, 1);
        let more = cg.cursor().ins().icmp(IntCC::SignedLessThan, next, num);
        tuples.loop_end(cg, more, &[next]);
        Ok(())
    }

    pub fn clear(&self, cg: &mut CodeGen, sorter: ir::Value) {
        cg.call_runtime_checked(RuntimeFunction::SorterClear, &[sorter]);
    }

    pub fn destroy(&self, cg: &mut CodeGen, sorter: ir::Value) {
        cg.call_runtime_checked(RuntimeFunction::SorterDestroy, &[sorter]);
    }

    /// Destroy for tear down. Skips sorters that were never initialized and
    /// never raises.
    pub fn release(&self, cg: &mut CodeGen, sorter: ir::Value) {
        cg.call_runtime(RuntimeFunction::SorterRelease, &[sorter]);
    }
}
