use cobalt_error::Result;
use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{self, InstBuilder};

use crate::codegen::hash_table::{HashTable, HashTableAccess, VectorizedIterateCallback};
use crate::codegen::lang::{If, Loop, Vector};
use crate::codegen::Value;
use crate::execution::aggregation::AggregateLayout;
use crate::execution::compilation_context::CompilationContext;
use crate::execution::expression::derive_values;
use crate::execution::pipeline::{PipelineId, TranslatorId};
use crate::execution::runtime_state::StateId;
use crate::execution::translator::OperatorTranslator;
use crate::planner::{AggregateExpr, Expression, PlanNode};
use crate::runtime::hash_table::{HASH_TABLE_SIZE, NUM_OCCUPIED_OFFSET};

/// Hash aggregation.
///
/// The input pipeline upserts every row into a hash table keyed on the
/// group values, folding it into the entry's aggregate state. Once the input
/// is exhausted the table is iterated and one row per group is emitted.
#[derive(Debug)]
pub struct HashGroupByTranslator {
    id: TranslatorId,
    pipeline: PipelineId,
    child_pipeline: PipelineId,
    input: TranslatorId,
    group_by: Vec<Expression>,
    layout: AggregateLayout,
    table: HashTable,
    table_state: StateId,
}

impl HashGroupByTranslator {
    pub fn new(
        ctx: &mut CompilationContext,
        id: TranslatorId,
        pipeline: PipelineId,
        input: &PlanNode,
        group_by: &[Expression],
        aggregates: &[AggregateExpr],
    ) -> Result<Self> {
        let input_types = input.output_schema()?;
        let key_types = group_by
            .iter()
            .map(|expr| expr.output_type(&input_types))
            .collect::<Result<Vec<_>>>()?;
        let layout = AggregateLayout::new(aggregates, &input_types)?;
        let table = HashTable::new(&key_types, layout.size());
        let table_state = ctx.runtime_state_mut().register("group_by_table", HASH_TABLE_SIZE);

        let child_pipeline = ctx.new_pipeline(Some(pipeline));
        let child = ctx.pipeline_mut(child_pipeline);
        child.add(id);
        child.install_stage_boundary(id);
        let input = ctx.prepare(input, child_pipeline)?;

        Ok(HashGroupByTranslator {
            id,
            pipeline,
            child_pipeline,
            input,
            group_by: group_by.to_vec(),
            layout,
            table,
            table_state,
        })
    }

    /// Without grouping keys, an empty input still produces a single row.
    fn emit_empty_result(&self, ctx: &mut CompilationContext, table: ir::Value) -> Result<()> {
        let cg = ctx.cg();
        let occupied = cg.load(ir::types::I64, table, NUM_OCCUPIED_OFFSET as i32);
        let empty = cg.cursor().ins().icmp_imm(IntCC::Equal, occupied, 0);
        let mut cond = If::new(cg, empty);
        let values = self.layout.empty_values(cg);
        ctx.consume(self.pipeline, self.id, &values)?;
        cond.end_if(ctx.cg());
        Ok(())
    }
}

struct EmitGroups<'t> {
    translator: &'t HashGroupByTranslator,
}

impl<'a> VectorizedIterateCallback<CompilationContext<'a>> for EmitGroups<'_> {
    fn process_entries(
        &mut self,
        ctx: &mut CompilationContext<'a>,
        access: &HashTableAccess<'_>,
        selection: &Vector,
        num_selected: ir::Value,
    ) -> Result<()> {
        let cg = ctx.cg();
        let zero = cg.const64(0);
        let any = cg.cursor().ins().icmp_imm(IntCC::SignedGreaterThan, num_selected, 0);
        let mut groups = Loop::new(cg, any, &[zero]);
        let pos = groups.loop_var(cg, 0);
        let slot = selection.get_value(cg, pos);

        let mut row = access.extract_bucket_keys(cg, slot);
        let data = access.bucket_value(cg, slot);
        row.extend(self.translator.layout.finalize(cg, data));
        ctx.consume(self.translator.pipeline, self.translator.id, &row)?;

        let cg = ctx.cg();
        let next = cg.cursor().ins().iadd_imm(pos, 1);
        let more = cg.cursor().ins().icmp(IntCC::SignedLessThan, next, num_selected);
        groups.loop_end(cg, more, &[next]);
        Ok(())
    }
}

impl OperatorTranslator for HashGroupByTranslator {
    fn name(&self) -> &'static str {
        "HashGroupBy"
    }

    fn initialize_query_state(&self, ctx: &mut CompilationContext) -> Result<()> {
        let capacity = ctx.config().hash_table_initial_capacity;
        let table = ctx.state_ptr(self.table_state);
        self.table.init(ctx.cg(), table, capacity);
        Ok(())
    }

    fn produce(&self, ctx: &mut CompilationContext) -> Result<()> {
        let input = self.input;
        ctx.run_pipeline(self.child_pipeline, |ctx| ctx.produce(input))?;

        let table = ctx.state_ptr(self.table_state);
        if self.group_by.is_empty() {
            self.emit_empty_result(ctx, table)?;
        }

        let batch_size = ctx.config().batch_size as u32;
        self.table
            .vectorized_iterate(ctx, table, batch_size, &mut EmitGroups { translator: self })
    }

    fn consume(&self, ctx: &mut CompilationContext, _pipeline: PipelineId, row: &[Value]) -> Result<()> {
        let table = ctx.state_ptr(self.table_state);
        let cg = ctx.cg();
        let keys = derive_values(cg, &self.group_by, row)?;
        let hash = self.table.hash_key(cg, &keys);
        // New entries start out zeroed, which is the empty aggregate state.
        let entry = self.table.probe_or_insert(cg, table, hash, &keys)?;
        self.layout.update(cg, entry.data_ptr, row)
    }

    fn tear_down_query_state(&self, ctx: &mut CompilationContext) -> Result<()> {
        let table = ctx.state_ptr(self.table_state);
        self.table.release(ctx.cg(), table);
        Ok(())
    }
}
