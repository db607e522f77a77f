use std::cell::OnceCell;

use cobalt_error::{DbError, Result};
use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::InstBuilder;

use crate::codegen::lang::If;
use crate::codegen::sorter::{Sorter, SorterIterateCallback};
use crate::codegen::types::TypeId;
use crate::codegen::{FunctionBuilder, FunctionDeclaration, PrimitiveType, Value};
use crate::execution::compilation_context::CompilationContext;
use crate::execution::expression::evaluate_predicate;
use crate::execution::pipeline::{PipelineId, TranslatorId};
use crate::execution::runtime_state::StateId;
use crate::execution::translator::OperatorTranslator;
use crate::planner::{Expression, PlanNode};
use crate::runtime::sorter::SORTER_SIZE;

/// Block nested loop join.
///
/// Left rows are buffered until a block is full. Each full block is joined
/// against a complete pass over the right input, run by a separate flush
/// function, and the buffer is cleared for the next block.
#[derive(Debug)]
pub struct BlockNestedLoopJoinTranslator {
    id: TranslatorId,
    pipeline: PipelineId,
    left_pipeline: PipelineId,
    right_pipeline: PipelineId,
    left: TranslatorId,
    right: TranslatorId,
    predicate: Option<Expression>,
    /// Buffer for the current block of left rows. Never sorted.
    buffer: Sorter,
    buffer_state: StateId,
    /// Function running the right pipeline over the buffered block.
    flush: OnceCell<FunctionDeclaration>,
}

impl BlockNestedLoopJoinTranslator {
    pub fn new(
        ctx: &mut CompilationContext,
        id: TranslatorId,
        pipeline: PipelineId,
        left: &PlanNode,
        right: &PlanNode,
        predicate: Option<&Expression>,
    ) -> Result<Self> {
        let left_types = left.output_schema()?;
        if let Some(predicate) = predicate {
            let mut joined = left_types.clone();
            joined.extend(right.output_schema()?);
            let ty = predicate.output_type(&joined)?;
            if ty.type_id != TypeId::Boolean {
                return Err(DbError::new("Join predicate must be boolean").with_field("type", ty));
            }
        }

        let buffer = Sorter::new(&left_types);
        let buffer_state = ctx.runtime_state_mut().register("nested_loop_buffer", SORTER_SIZE);

        let left_pipeline = ctx.new_pipeline(Some(pipeline));
        let p = ctx.pipeline_mut(left_pipeline);
        p.add(id);
        p.install_stage_boundary(id);
        let left = ctx.prepare(left, left_pipeline)?;

        let right_pipeline = ctx.new_pipeline(Some(pipeline));
        ctx.pipeline_mut(right_pipeline).add(id);
        let right = ctx.prepare(right, right_pipeline)?;

        Ok(BlockNestedLoopJoinTranslator {
            id,
            pipeline,
            left_pipeline,
            right_pipeline,
            left,
            right,
            predicate: predicate.cloned(),
            buffer,
            buffer_state,
            flush: OnceCell::new(),
        })
    }

    fn flush_function(&self) -> Result<&FunctionDeclaration> {
        self.flush
            .get()
            .ok_or_else(|| DbError::new("Nested loop join flush function not generated"))
    }

    /// Generate the function joining the buffered block with the right
    /// input. Takes the runtime state.
    fn build_flush(&self, ctx: &mut CompilationContext) -> Result<FunctionDeclaration> {
        let name = format!("nested_loop_{}_flush", self.id);
        let func = FunctionBuilder::new(ctx.cg(), &name, &[PrimitiveType::VoidPtr], PrimitiveType::Void)?;
        let right = self.right;
        ctx.run_pipeline(self.right_pipeline, |ctx| ctx.produce(right))?;
        Ok(func.return_and_finish(ctx.cg(), None))
    }

    /// Join the buffered rows with every row of the right input and empty
    /// the buffer.
    fn emit_flush(&self, ctx: &mut CompilationContext) -> Result<()> {
        let flush = self.flush_function()?.clone();
        let runtime_state = ctx.runtime_state_ptr();
        let buffer = ctx.state_ptr(self.buffer_state);
        let cg = ctx.cg();
        cg.call_func_checked(&flush, &[runtime_state]);
        self.buffer.clear(cg, buffer);
        Ok(())
    }
}

struct JoinBlock<'t> {
    translator: &'t BlockNestedLoopJoinTranslator,
    right: &'t [Value],
}

impl<'a> SorterIterateCallback<CompilationContext<'a>> for JoinBlock<'_> {
    fn process_tuple(&mut self, ctx: &mut CompilationContext<'a>, left: &[Value]) -> Result<()> {
        let translator = self.translator;
        let mut row = left.to_vec();
        row.extend_from_slice(self.right);

        match &translator.predicate {
            Some(predicate) => {
                let cg = ctx.cg();
                let passes = evaluate_predicate(cg, predicate, &row)?;
                let mut cond = If::new(cg, passes);
                ctx.consume(translator.pipeline, translator.id, &row)?;
                cond.end_if(ctx.cg());
                Ok(())
            }
            None => ctx.consume(translator.pipeline, translator.id, &row),
        }
    }
}

impl OperatorTranslator for BlockNestedLoopJoinTranslator {
    fn name(&self) -> &'static str {
        "NestedLoopJoin"
    }

    fn initialize_query_state(&self, ctx: &mut CompilationContext) -> Result<()> {
        let buffer = ctx.state_ptr(self.buffer_state);
        self.buffer.init(ctx.cg(), buffer);
        Ok(())
    }

    fn produce(&self, ctx: &mut CompilationContext) -> Result<()> {
        let flush = self.build_flush(ctx)?;
        if self.flush.set(flush).is_err() {
            return Err(DbError::new("Nested loop join produced twice"));
        }

        let left = self.left;
        ctx.run_pipeline(self.left_pipeline, |ctx| ctx.produce(left))?;

        // Last, partially filled block.
        let buffer = ctx.state_ptr(self.buffer_state);
        let cg = ctx.cg();
        let num_buffered = self.buffer.num_tuples(cg, buffer);
        let any = cg.cursor().ins().icmp_imm(IntCC::SignedGreaterThan, num_buffered, 0);
        let mut cond = If::new(cg, any);
        self.emit_flush(ctx)?;
        cond.end_if(ctx.cg());

        Ok(())
    }

    fn consume(&self, ctx: &mut CompilationContext, pipeline: PipelineId, row: &[Value]) -> Result<()> {
        let buffer = ctx.state_ptr(self.buffer_state);

        if pipeline == self.left_pipeline {
            let block_size = ctx.config().nested_loop_block_size as i64;
            let cg = ctx.cg();
            self.buffer.store_tuple(cg, buffer, row);
            let num_buffered = self.buffer.num_tuples(cg, buffer);
            let full = cg
                .cursor()
                .ins()
                .icmp_imm(IntCC::SignedGreaterThanOrEqual, num_buffered, block_size);
            let mut cond = If::new(cg, full);
            self.emit_flush(ctx)?;
            cond.end_if(ctx.cg());
            return Ok(());
        }

        self.buffer.iterate(
            ctx,
            buffer,
            &mut JoinBlock {
                translator: self,
                right: row,
            },
        )
    }

    fn tear_down_query_state(&self, ctx: &mut CompilationContext) -> Result<()> {
        let buffer = ctx.state_ptr(self.buffer_state);
        self.buffer.release(ctx.cg(), buffer);
        Ok(())
    }
}
