use cobalt_error::Result;
use cranelift_codegen::ir;

use crate::codegen::compact_storage::CompactStorage;
use crate::codegen::hash_table::{HashTable, ProbeCallback};
use crate::codegen::lang::If;
use crate::codegen::runtime_functions::RuntimeFunction;
use crate::codegen::types::Type;
use crate::codegen::value::logical_and_all;
use crate::codegen::{CodeGen, Value};
use crate::execution::compilation_context::CompilationContext;
use crate::execution::expression::derive_values;
use crate::execution::pipeline::{PipelineId, TranslatorId};
use crate::execution::runtime_state::StateId;
use crate::execution::translator::OperatorTranslator;
use crate::planner::plan::join_key_types;
use crate::planner::{Expression, PlanNode};
use crate::runtime::hash_table::HASH_TABLE_SIZE;

/// Inner equi-join.
///
/// The left input is materialized into a hash table in its own pipeline,
/// then the right input probes it in the join's pipeline. Rows with a NULL
/// key never match and are skipped on both sides.
///
/// The build pipeline may run in parallel. Each worker then inserts into a
/// thread local table, and the workers merge their tables into the global
/// one once every worker has finished.
#[derive(Debug)]
pub struct HashJoinTranslator {
    id: TranslatorId,
    pipeline: PipelineId,
    build_pipeline: PipelineId,
    left: TranslatorId,
    right: TranslatorId,
    left_keys: Vec<Expression>,
    right_keys: Vec<Expression>,
    key_types: Vec<Type>,
    /// Layout of the left row stored as the entry value.
    left_storage: CompactStorage,
    table: HashTable,
    table_state: StateId,
    /// Offset of the thread local table in the build pipeline's state.
    local_table_offset: usize,
}

impl HashJoinTranslator {
    pub fn new(
        ctx: &mut CompilationContext,
        id: TranslatorId,
        pipeline: PipelineId,
        left: &PlanNode,
        right: &PlanNode,
        left_keys: &[Expression],
        right_keys: &[Expression],
    ) -> Result<Self> {
        let left_types = left.output_schema()?;
        let right_types = right.output_schema()?;
        let key_types = join_key_types(left_keys, &left_types, right_keys, &right_types)?;

        let left_storage = CompactStorage::for_schema(&left_types);
        let table = HashTable::new(&key_types, left_storage.storage_size());
        let table_state = ctx.runtime_state_mut().register("hash_join_table", HASH_TABLE_SIZE);

        let right = ctx.prepare(right, pipeline)?;

        let build_pipeline = ctx.new_pipeline(Some(pipeline));
        let build = ctx.pipeline_mut(build_pipeline);
        build.add(id);
        build.install_stage_boundary(id);
        let local_table_offset = build.register_state(HASH_TABLE_SIZE);
        let left = ctx.prepare(left, build_pipeline)?;

        Ok(HashJoinTranslator {
            id,
            pipeline,
            build_pipeline,
            left,
            right,
            left_keys: left_keys.to_vec(),
            right_keys: right_keys.to_vec(),
            key_types,
            left_storage,
            table,
            table_state,
            local_table_offset,
        })
    }

    /// Compute the join keys for `row`, cast to the common key types.
    fn derive_keys(&self, cg: &mut CodeGen, exprs: &[Expression], row: &[Value]) -> Result<Vec<Value>> {
        derive_values(cg, exprs, row)?
            .iter()
            .zip(&self.key_types)
            .map(|(key, ty)| key.cast_to(cg, ty.type_id))
            .collect()
    }

    /// Open a conditional that's only entered if no key is NULL. Returns
    /// `None` if none of the keys can be NULL.
    fn skip_null_keys(cg: &mut CodeGen, keys: &[Value]) -> Option<If> {
        let flags: Vec<_> = keys
            .iter()
            .filter(|key| key.is_nullable())
            .map(|key| key.is_not_null(cg))
            .collect();
        if flags.is_empty() {
            return None;
        }
        let no_nulls = logical_and_all(cg, &flags);
        Some(If::new(cg, no_nulls))
    }

    fn build_is_parallel(&self, ctx: &CompilationContext) -> bool {
        ctx.is_parallel(self.build_pipeline)
    }

    fn consume_build(&self, ctx: &mut CompilationContext, row: &[Value]) -> Result<()> {
        let table = if self.build_is_parallel(ctx) {
            ctx.pipeline_state_ptr(self.build_pipeline, self.local_table_offset)
        } else {
            ctx.state_ptr(self.table_state)
        };

        let cg = ctx.cg();
        let keys = self.derive_keys(cg, &self.left_keys, row)?;
        let non_null = Self::skip_null_keys(cg, &keys);

        let hash = self.table.hash_key(cg, &keys);
        let data = self.table.insert_lazy(cg, table, hash, &keys);
        self.left_storage.store_values(cg, data, row);

        if let Some(mut non_null) = non_null {
            non_null.end_if(cg);
        }
        Ok(())
    }

    fn consume_probe(&self, ctx: &mut CompilationContext, row: &[Value]) -> Result<()> {
        let table = ctx.state_ptr(self.table_state);

        let cg = ctx.cg();
        let keys = self.derive_keys(cg, &self.right_keys, row)?;
        let non_null = Self::skip_null_keys(cg, &keys);

        let hash = self.table.hash_key(cg, &keys);
        let mut matches = EmitMatches {
            translator: self,
            right: row,
        };
        self.table.find_all(ctx, table, hash, &keys, &mut matches)?;

        if let Some(mut non_null) = non_null {
            non_null.end_if(ctx.cg());
        }
        Ok(())
    }

    /// Move the thread local tables into the global table.
    fn merge_local_tables(&self, ctx: &mut CompilationContext) {
        let worker = ctx.worker_context(self.build_pipeline);
        let thread_states = ctx.thread_states_ptr(self.build_pipeline);
        let global = ctx.state_ptr(self.table_state);
        let local = ctx.pipeline_state_ptr(self.build_pipeline, self.local_table_offset);

        let cg = ctx.cg();
        // Once every worker is done inserting, a single worker sizes the
        // global table for all of them.
        let leader = cg.call_runtime_value(RuntimeFunction::BarrierWait, &[worker]);
        let mut reserve = If::new(cg, leader);
        self.table
            .reserve_lazy(cg, global, thread_states, self.local_table_offset);
        reserve.end_if(cg);

        cg.call_runtime_checked(RuntimeFunction::BarrierWait, &[worker]);
        cg.call_runtime_checked(RuntimeFunction::MergeToGlobalHashTable, &[worker, global, local]);
        self.table.destroy(cg, local);
    }
}

struct EmitMatches<'t> {
    translator: &'t HashJoinTranslator,
    right: &'t [Value],
}

impl<'a> ProbeCallback<CompilationContext<'a>> for EmitMatches<'_> {
    fn process_entry(&mut self, ctx: &mut CompilationContext<'a>, data: ir::Value) -> Result<()> {
        let (mut row, _) = self.translator.left_storage.load_values(ctx.cg(), data);
        row.extend_from_slice(self.right);
        ctx.consume(self.translator.pipeline, self.translator.id, &row)
    }
}

impl OperatorTranslator for HashJoinTranslator {
    fn name(&self) -> &'static str {
        "HashJoin"
    }

    fn initialize_query_state(&self, ctx: &mut CompilationContext) -> Result<()> {
        let capacity = ctx.config().hash_table_initial_capacity;
        let table = ctx.state_ptr(self.table_state);
        self.table.init(ctx.cg(), table, capacity);
        Ok(())
    }

    fn initialize_pipeline_state(&self, ctx: &mut CompilationContext, pipeline: PipelineId) -> Result<()> {
        if pipeline == self.build_pipeline && self.build_is_parallel(ctx) {
            let capacity = ctx.config().hash_table_initial_capacity;
            let local = ctx.pipeline_state_ptr(pipeline, self.local_table_offset);
            self.table.init(ctx.cg(), local, capacity);
        }
        Ok(())
    }

    fn produce(&self, ctx: &mut CompilationContext) -> Result<()> {
        let left = self.left;
        ctx.run_pipeline(self.build_pipeline, |ctx| ctx.produce(left))?;
        ctx.produce(self.right)
    }

    fn consume(&self, ctx: &mut CompilationContext, pipeline: PipelineId, row: &[Value]) -> Result<()> {
        if pipeline == self.build_pipeline {
            self.consume_build(ctx, row)
        } else {
            self.consume_probe(ctx, row)
        }
    }

    fn finish_pipeline(&self, ctx: &mut CompilationContext, pipeline: PipelineId) -> Result<()> {
        if pipeline != self.build_pipeline {
            return Ok(());
        }
        if self.build_is_parallel(ctx) {
            self.merge_local_tables(ctx);
        } else {
            let table = ctx.state_ptr(self.table_state);
            self.table.build_lazy(ctx.cg(), table);
        }
        Ok(())
    }

    fn tear_down_query_state(&self, ctx: &mut CompilationContext) -> Result<()> {
        if self.build_is_parallel(ctx) {
            // Workers that failed before merging leave their tables behind.
            let thread_states = ctx.thread_states_ptr(self.build_pipeline);
            let cg = ctx.cg();
            let offset = cg.const64(self.local_table_offset as i64);
            cg.call_runtime(
                RuntimeFunction::ThreadStatesDestroyHashTables,
                &[thread_states, offset],
            );
        }
        let table = ctx.state_ptr(self.table_state);
        self.table.release(ctx.cg(), table);
        Ok(())
    }

    fn supports_parallel(&self, pipeline: PipelineId) -> bool {
        pipeline == self.build_pipeline
    }
}
