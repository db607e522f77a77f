use cobalt_error::Result;

use crate::codegen::Value;
use crate::execution::compilation_context::CompilationContext;
use crate::execution::expression::derive_values;
use crate::execution::pipeline::{PipelineId, TranslatorId};
use crate::execution::translator::OperatorTranslator;
use crate::planner::{Expression, PlanNode};

#[derive(Debug)]
pub struct ProjectionTranslator {
    id: TranslatorId,
    input: TranslatorId,
    exprs: Vec<Expression>,
}

impl ProjectionTranslator {
    pub fn new(
        ctx: &mut CompilationContext,
        id: TranslatorId,
        pipeline: PipelineId,
        input: &PlanNode,
        exprs: &[Expression],
    ) -> Result<Self> {
        let input_types = input.output_schema()?;
        for expr in exprs {
            expr.output_type(&input_types)?;
        }
        let input = ctx.prepare(input, pipeline)?;

        Ok(ProjectionTranslator {
            id,
            input,
            exprs: exprs.to_vec(),
        })
    }
}

impl OperatorTranslator for ProjectionTranslator {
    fn name(&self) -> &'static str {
        "Projection"
    }

    fn produce(&self, ctx: &mut CompilationContext) -> Result<()> {
        ctx.produce(self.input)
    }

    fn consume(&self, ctx: &mut CompilationContext, pipeline: PipelineId, row: &[Value]) -> Result<()> {
        let output = derive_values(ctx.cg(), &self.exprs, row)?;
        ctx.consume(pipeline, self.id, &output)
    }

    fn supports_parallel(&self, _pipeline: PipelineId) -> bool {
        true
    }
}
