use std::fmt;

use cobalt_error::Result;

use super::compilation_context::CompilationContext;
use super::pipeline::PipelineId;
use crate::codegen::Value;

/// Generates the code for one plan operator.
///
/// Translators are created while the plan is walked top down, registering
/// the runtime state they need and the pipelines they take part in. Code
/// generation then happens in the push model: `produce` starts the flow of
/// rows at the source of a pipeline, `consume` handles a single row arriving
/// from upstream in one of the translator's pipelines.
pub trait OperatorTranslator: fmt::Debug {
    fn name(&self) -> &'static str;

    /// Emit code into the query's init function.
    fn initialize_query_state(&self, _ctx: &mut CompilationContext) -> Result<()> {
        Ok(())
    }

    /// Emit code run at the start of each invocation of `pipeline`.
    fn initialize_pipeline_state(&self, _ctx: &mut CompilationContext, _pipeline: PipelineId) -> Result<()> {
        Ok(())
    }

    fn produce(&self, ctx: &mut CompilationContext) -> Result<()>;

    fn consume(&self, ctx: &mut CompilationContext, pipeline: PipelineId, row: &[Value]) -> Result<()>;

    /// Emit code run after all rows of `pipeline` have been pushed through.
    fn finish_pipeline(&self, _ctx: &mut CompilationContext, _pipeline: PipelineId) -> Result<()> {
        Ok(())
    }

    /// Emit code into the query's tear down function. Must release anything
    /// `initialize_query_state` acquired, even if the query failed midway.
    fn tear_down_query_state(&self, _ctx: &mut CompilationContext) -> Result<()> {
        Ok(())
    }

    /// If the translator's part of `pipeline` may run on multiple workers at
    /// once.
    fn supports_parallel(&self, _pipeline: PipelineId) -> bool {
        false
    }
}
