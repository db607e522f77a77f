//! Translators for each physical plan operator.

mod block_nested_loop_join;
mod hash_group_by;
mod hash_join;
mod order_by;
mod projection;
mod table_scan;

use std::rc::Rc;

use cobalt_error::Result;

pub use block_nested_loop_join::BlockNestedLoopJoinTranslator;
pub use hash_group_by::HashGroupByTranslator;
pub use hash_join::HashJoinTranslator;
pub use order_by::OrderByTranslator;
pub use projection::ProjectionTranslator;
pub use table_scan::TableScanTranslator;

use super::compilation_context::CompilationContext;
use super::pipeline::{PipelineId, TranslatorId};
use super::translator::OperatorTranslator;
use crate::planner::PlanNode;

/// Create the translator for `plan`, already added to `pipeline` under `id`.
/// Children are prepared recursively.
pub(crate) fn create_translator(
    ctx: &mut CompilationContext,
    id: TranslatorId,
    plan: &PlanNode,
    pipeline: PipelineId,
) -> Result<Rc<dyn OperatorTranslator>> {
    Ok(match plan {
        PlanNode::SeqScan {
            table_id,
            schema,
            columns,
            predicate,
        } => Rc::new(TableScanTranslator::new(
            ctx,
            id,
            pipeline,
            *table_id,
            schema,
            columns,
            predicate.as_ref(),
        )?),
        PlanNode::Projection { input, exprs } => Rc::new(ProjectionTranslator::new(ctx, id, pipeline, input, exprs)?),
        PlanNode::NestedLoopJoin { left, right, predicate } => Rc::new(BlockNestedLoopJoinTranslator::new(
            ctx,
            id,
            pipeline,
            left,
            right,
            predicate.as_ref(),
        )?),
        PlanNode::HashJoin {
            left,
            right,
            left_keys,
            right_keys,
        } => Rc::new(HashJoinTranslator::new(
            ctx, id, pipeline, left, right, left_keys, right_keys,
        )?),
        PlanNode::HashGroupBy {
            input,
            group_by,
            aggregates,
        } => Rc::new(HashGroupByTranslator::new(
            ctx, id, pipeline, input, group_by, aggregates,
        )?),
        PlanNode::OrderBy { input, keys } => Rc::new(OrderByTranslator::new(ctx, id, pipeline, input, keys)?),
    })
}
