use std::time::{Duration, Instant};

use cobalt_error::Result;
use tracing::debug;

use super::compilation_context::CompilationContext;
use super::consumer::QueryResultConsumer;
use super::query_statement::QueryStatement;
use crate::codegen::CodeGen;
use crate::codegen::types::Registry;
use crate::config::CompilerConfig;
use crate::planner::PlanNode;

/// Profile data for compiling a single query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompileStats {
    /// Time taken to create the code context and check the consumer.
    pub setup: Duration,
    /// Time taken to translate the plan into IR.
    pub generation: Duration,
    /// Time taken to verify, optimize and JIT the IR.
    pub jit: Duration,
    pub num_pipelines: usize,
    pub num_stages: usize,
    pub num_functions: usize,
}

/// Compiles physical plans into executable statements.
#[derive(Debug)]
pub struct QueryCompiler<'r> {
    registry: &'r Registry,
    config: CompilerConfig,
}

impl<'r> QueryCompiler<'r> {
    pub fn new(registry: &'r Registry, config: CompilerConfig) -> Self {
        QueryCompiler { registry, config }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut CompilerConfig {
        &mut self.config
    }

    /// Compile `plan` for execution with consumers of the same kind as
    /// `consumer`.
    pub fn compile(&self, plan: &PlanNode, consumer: &dyn QueryResultConsumer) -> Result<QueryStatement> {
        self.compile_with_stats(plan, consumer, None)
    }

    pub fn compile_with_stats(
        &self,
        plan: &PlanNode,
        consumer: &dyn QueryResultConsumer,
        stats: Option<&mut CompileStats>,
    ) -> Result<QueryStatement> {
        let start = Instant::now();
        consumer.prepare(&plan.output_schema()?)?;
        let mut code_context = self
            .registry
            .code_context_factory()
            .create(self.config.codegen_options())?;
        let setup = start.elapsed();

        let start = Instant::now();
        let (functions, parameter_size, tables, num_pipelines, num_stages) = {
            let cg = CodeGen::new(&mut code_context, self.registry);
            let mut ctx = CompilationContext::new(cg, &self.config, consumer);
            let functions = ctx.generate(plan)?;
            (
                functions,
                ctx.runtime_state().size(),
                ctx.table_accesses().to_vec(),
                ctx.num_pipelines(),
                ctx.num_stages(),
            )
        };
        let num_functions = code_context.num_finished_functions();
        let generation = start.elapsed();

        let start = Instant::now();
        let mut statement = QueryStatement::new(code_context, functions, parameter_size, consumer.kind(), tables);
        statement.setup()?;
        let jit = start.elapsed();

        let compile_stats = CompileStats {
            setup,
            generation,
            jit,
            num_pipelines,
            num_stages,
            num_functions,
        };
        debug!(?compile_stats, "compiled query");
        if let Some(stats) = stats {
            *stats = compile_stats;
        }

        Ok(statement)
    }
}
