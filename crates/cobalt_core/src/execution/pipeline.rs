use cobalt_error::Result;
use tracing::debug;

use super::compilation_context::{ActivePipeline, CompilationContext};
use super::runtime_state::StateId;
use crate::codegen::runtime_functions::RuntimeFunction;
use crate::codegen::{FunctionBuilder, PrimitiveType};

pub type PipelineId = usize;
pub type TranslatorId = usize;

/// A chain of operators data is pushed through without materialization.
///
/// Translators are stored in the order they were added, which is the order
/// the plan is walked: the most downstream operator comes first, the source
/// of the pipeline last. Producing starts at the source and each operator
/// hands its output to the one before it.
#[derive(Debug, Clone)]
pub struct Pipeline {
    id: PipelineId,
    /// Pipeline whose execution drives this one.
    parent: Option<PipelineId>,
    translators: Vec<TranslatorId>,
    /// Positions where a new stage starts.
    stage_boundaries: Vec<usize>,
    cursor: usize,
    /// Bytes of pipeline local state.
    state_size: usize,
    parallel: bool,
    /// Runtime state holding the pipeline state for serial execution, or the
    /// thread states for parallel execution.
    state_id: Option<StateId>,
}

impl Pipeline {
    pub fn new(id: PipelineId, parent: Option<PipelineId>) -> Self {
        Pipeline {
            id,
            parent,
            translators: Vec::new(),
            stage_boundaries: Vec::new(),
            cursor: 0,
            state_size: 0,
            parallel: false,
            state_id: None,
        }
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn parent(&self) -> Option<PipelineId> {
        self.parent
    }

    pub fn translators(&self) -> &[TranslatorId] {
        &self.translators
    }

    pub fn add(&mut self, translator: TranslatorId) {
        assert!(
            !self.translators.contains(&translator),
            "translator {translator} already in pipeline {}",
            self.id
        );
        self.translators.push(translator);
        self.cursor = self.translators.len() - 1;
    }

    /// Start a new stage after `translator`, which must be the translator
    /// last added.
    pub fn install_stage_boundary(&mut self, translator: TranslatorId) {
        assert_eq!(
            Some(&translator),
            self.translators.get(self.cursor),
            "stage boundary must follow the translator at the cursor"
        );
        self.stage_boundaries.push(self.cursor + 1);
    }

    pub fn position_of(&self, translator: TranslatorId) -> usize {
        match self.translators.iter().position(|t| *t == translator) {
            Some(pos) => pos,
            None => panic!("translator {translator} not in pipeline {}", self.id),
        }
    }

    /// Move the cursor to `translator`.
    pub fn set_cursor(&mut self, translator: TranslatorId) {
        self.cursor = self.position_of(translator);
    }

    /// Move the cursor one step downstream, returning the translator under
    /// it. `None` once the cursor is at the most downstream translator.
    pub fn next_step(&mut self) -> Option<TranslatorId> {
        if self.cursor == 0 {
            return None;
        }
        self.cursor -= 1;
        Some(self.translators[self.cursor])
    }

    pub fn get_translator_stage(&self, translator: TranslatorId) -> usize {
        let pos = self.position_of(translator);
        self.stage_boundaries.iter().filter(|b| **b <= pos).count()
    }

    pub fn num_stages(&self) -> usize {
        self.stage_boundaries.len() + 1
    }

    /// Reserve pipeline local state, returning its offset in the pipeline
    /// state block.
    pub fn register_state(&mut self, size: usize) -> usize {
        let offset = self.state_size;
        self.state_size += size.max(1).next_multiple_of(8);
        offset
    }

    pub fn state_size(&self) -> usize {
        self.state_size
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    pub(crate) fn set_parallel(&mut self, parallel: bool) {
        self.parallel = parallel;
    }

    pub(crate) fn state_id(&self) -> Option<StateId> {
        self.state_id
    }

    pub(crate) fn set_state_id(&mut self, id: StateId) {
        self.state_id = Some(id);
    }

    /// Generate a function running the pipeline on the calling thread, and
    /// call it from the current function.
    ///
    /// The function takes the runtime state as its only argument.
    pub fn run_serial<'a, F>(ctx: &mut CompilationContext<'a>, id: PipelineId, body: F) -> Result<()>
    where
        F: FnOnce(&mut CompilationContext<'a>) -> Result<()>,
    {
        let name = format!("pipeline_{id}");
        let func = FunctionBuilder::new(ctx.cg(), &name, &[PrimitiveType::VoidPtr], PrimitiveType::Void)?;
        let depth = ctx.cg().function_depth();
        ctx.push_active(ActivePipeline {
            pipeline: id,
            depth,
            parallel: false,
        });

        ctx.initialize_pipeline_state(id)?;
        body(ctx)?;
        ctx.finish_pipeline(id)?;

        ctx.pop_active(id);
        let decl = func.return_and_finish(ctx.cg(), None);

        let runtime_state = ctx.runtime_state_ptr();
        ctx.cg().call_func_checked(&decl, &[runtime_state]);

        debug!(pipeline = %id, function = %decl.name(), "generated serial pipeline");

        Ok(())
    }

    /// Generate a worker function running the pipeline, and drive it on the
    /// configured number of workers from the current function.
    ///
    /// Worker functions take `(runtime_state, pipeline_state, worker_ctx)`.
    pub fn run_parallel<'a, F>(ctx: &mut CompilationContext<'a>, id: PipelineId, body: F) -> Result<()>
    where
        F: FnOnce(&mut CompilationContext<'a>) -> Result<()>,
    {
        let name = format!("pipeline_{id}_worker");
        let func = FunctionBuilder::new(
            ctx.cg(),
            &name,
            &[PrimitiveType::VoidPtr, PrimitiveType::VoidPtr, PrimitiveType::VoidPtr],
            PrimitiveType::Void,
        )?;
        let depth = ctx.cg().function_depth();
        ctx.push_active(ActivePipeline {
            pipeline: id,
            depth,
            parallel: true,
        });

        ctx.initialize_pipeline_state(id)?;
        body(ctx)?;
        ctx.finish_pipeline(id)?;

        ctx.pop_active(id);
        let decl = func.return_and_finish(ctx.cg(), None);

        let num_workers = ctx.config().parallel_workers;
        let state_size = ctx.pipeline(id).state_size();
        let thread_states = ctx.thread_states_ptr(id);
        let runtime_state = ctx.runtime_state_ptr();

        let cg = ctx.cg();
        let func_addr = cg.func_addr(&decl);
        let num_workers = cg.const64(num_workers as i64);
        let state_size = cg.const64(state_size as i64);
        cg.call_runtime_checked(
            RuntimeFunction::RunParallel,
            &[func_addr, runtime_state, thread_states, num_workers, state_size],
        );

        debug!(pipeline = %id, function = %decl.name(), "generated parallel pipeline");

        Ok(())
    }
}
