use cobalt_error::{DbError, Result};

use crate::codegen::Value;
use crate::codegen::sorter::{SortColumn, Sorter, SorterIterateCallback};
use crate::execution::compilation_context::CompilationContext;
use crate::execution::pipeline::{PipelineId, TranslatorId};
use crate::execution::runtime_state::StateId;
use crate::execution::translator::OperatorTranslator;
use crate::planner::{PlanNode, SortKey};
use crate::runtime::sorter::SORTER_SIZE;

/// Materializes its input into a sorter, then emits the sorted rows.
#[derive(Debug)]
pub struct OrderByTranslator {
    id: TranslatorId,
    pipeline: PipelineId,
    /// Pipeline filling the sorter.
    child_pipeline: PipelineId,
    input: TranslatorId,
    sorter: Sorter,
    sorter_state: StateId,
    columns: Vec<SortColumn>,
}

impl OrderByTranslator {
    pub fn new(
        ctx: &mut CompilationContext,
        id: TranslatorId,
        pipeline: PipelineId,
        input: &PlanNode,
        keys: &[SortKey],
    ) -> Result<Self> {
        let schema = input.output_schema()?;
        if let Some(key) = keys.iter().find(|key| key.column >= schema.len()) {
            return Err(DbError::new("Sort key out of range")
                .with_field("column", key.column)
                .with_field("num_columns", schema.len()));
        }

        let sorter = Sorter::new(&schema);
        let sorter_state = ctx.runtime_state_mut().register("order_by_sorter", SORTER_SIZE);

        let child_pipeline = ctx.new_pipeline(Some(pipeline));
        let child = ctx.pipeline_mut(child_pipeline);
        child.add(id);
        child.install_stage_boundary(id);
        let input = ctx.prepare(input, child_pipeline)?;

        let columns = keys
            .iter()
            .map(|key| SortColumn {
                index: key.column,
                descending: key.descending,
            })
            .collect();

        Ok(OrderByTranslator {
            id,
            pipeline,
            child_pipeline,
            input,
            sorter,
            sorter_state,
            columns,
        })
    }
}

struct EmitSorted<'t> {
    translator: &'t OrderByTranslator,
}

impl<'a> SorterIterateCallback<CompilationContext<'a>> for EmitSorted<'_> {
    fn process_tuple(&mut self, ctx: &mut CompilationContext<'a>, values: &[Value]) -> Result<()> {
        ctx.consume(self.translator.pipeline, self.translator.id, values)
    }
}

impl OperatorTranslator for OrderByTranslator {
    fn name(&self) -> &'static str {
        "OrderBy"
    }

    fn initialize_query_state(&self, ctx: &mut CompilationContext) -> Result<()> {
        let sorter = ctx.state_ptr(self.sorter_state);
        self.sorter.init(ctx.cg(), sorter);
        Ok(())
    }

    fn produce(&self, ctx: &mut CompilationContext) -> Result<()> {
        let input = self.input;
        ctx.run_pipeline(self.child_pipeline, |ctx| ctx.produce(input))?;

        let sorter = ctx.state_ptr(self.sorter_state);
        let name = format!("order_by_{}_compare", self.id);
        let comparator = self.sorter.build_comparator(ctx.cg(), &name, &self.columns)?;
        self.sorter.sort(ctx.cg(), sorter, &comparator);

        self.sorter
            .iterate(ctx, sorter, &mut EmitSorted { translator: self })
    }

    fn consume(&self, ctx: &mut CompilationContext, _pipeline: PipelineId, row: &[Value]) -> Result<()> {
        let sorter = ctx.state_ptr(self.sorter_state);
        self.sorter.store_tuple(ctx.cg(), sorter, row);
        Ok(())
    }

    fn tear_down_query_state(&self, ctx: &mut CompilationContext) -> Result<()> {
        let sorter = ctx.state_ptr(self.sorter_state);
        self.sorter.release(ctx.cg(), sorter);
        Ok(())
    }
}
