use std::rc::Rc;

use cobalt_error::{DbError, Result};
use cranelift_codegen::ir;
use tracing::{debug, trace};

use super::consumer::QueryResultConsumer;
use super::operators::create_translator;
use super::pipeline::{Pipeline, PipelineId, TranslatorId};
use super::runtime_state::{RuntimeState, StateId};
use super::translator::OperatorTranslator;
use crate::codegen::runtime_functions::RuntimeFunction;
use crate::codegen::types::Type;
use crate::codegen::{CodeGen, FunctionBuilder, FunctionDeclaration, PrimitiveType, Value};
use crate::config::CompilerConfig;
use crate::planner::PlanNode;
use crate::runtime::multi_thread::THREAD_STATES_SIZE;

/// A pipeline whose function is currently being generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivePipeline {
    pub pipeline: PipelineId,
    /// Function depth of the pipeline's function.
    pub depth: usize,
    pub parallel: bool,
}

/// The three entry points of a compiled query. Each takes a pointer to the
/// runtime state as its only argument.
#[derive(Debug, Clone)]
pub struct QueryFunctions {
    pub init: FunctionDeclaration,
    pub plan: FunctionDeclaration,
    pub tear_down: FunctionDeclaration,
}

/// A table read by the query. Checked against the catalog before each
/// execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableAccess {
    pub table_id: u32,
    pub schema: Vec<Type>,
}

/// State shared by all translators while compiling a single query.
#[derive(Debug)]
pub struct CompilationContext<'a> {
    cg: CodeGen<'a>,
    config: &'a CompilerConfig,
    consumer: &'a dyn QueryResultConsumer,
    runtime_state: RuntimeState,
    pipelines: Vec<Pipeline>,
    /// Slots are reserved before a translator is constructed so children
    /// prepared during construction get later ids.
    translators: Vec<Option<Rc<dyn OperatorTranslator>>>,
    active: Vec<ActivePipeline>,
    tables: Vec<TableAccess>,
}

impl<'a> AsMut<CodeGen<'a>> for CompilationContext<'a> {
    fn as_mut(&mut self) -> &mut CodeGen<'a> {
        &mut self.cg
    }
}

impl<'a> CompilationContext<'a> {
    pub fn new(cg: CodeGen<'a>, config: &'a CompilerConfig, consumer: &'a dyn QueryResultConsumer) -> Self {
        CompilationContext {
            cg,
            config,
            consumer,
            runtime_state: RuntimeState::new(),
            pipelines: Vec::new(),
            translators: Vec::new(),
            active: Vec::new(),
            tables: Vec::new(),
        }
    }

    pub fn cg(&mut self) -> &mut CodeGen<'a> {
        &mut self.cg
    }

    pub fn config(&self) -> &'a CompilerConfig {
        self.config
    }

    pub fn runtime_state(&self) -> &RuntimeState {
        &self.runtime_state
    }

    pub fn runtime_state_mut(&mut self) -> &mut RuntimeState {
        &mut self.runtime_state
    }

    /// Pointer to the runtime state, the first argument of every function
    /// generated for the query.
    pub fn runtime_state_ptr(&self) -> ir::Value {
        self.cg.get_argument(0)
    }

    pub fn consumer_state_ptr(&mut self) -> ir::Value {
        let runtime_state = self.runtime_state_ptr();
        RuntimeState::load_consumer_state(&mut self.cg, runtime_state)
    }

    pub fn catalog_ptr(&mut self) -> ir::Value {
        let runtime_state = self.runtime_state_ptr();
        RuntimeState::load_catalog(&mut self.cg, runtime_state)
    }

    /// Pointer to a registered runtime state entry.
    pub fn state_ptr(&mut self, id: StateId) -> ir::Value {
        let runtime_state = self.runtime_state_ptr();
        self.runtime_state.state_ptr(&mut self.cg, runtime_state, id)
    }

    pub fn register_table_access(&mut self, table_id: u32, schema: &[Type]) {
        let access = TableAccess {
            table_id,
            schema: schema.to_vec(),
        };
        if !self.tables.contains(&access) {
            self.tables.push(access);
        }
    }

    pub fn table_accesses(&self) -> &[TableAccess] {
        &self.tables
    }

    pub fn pipeline(&self, id: PipelineId) -> &Pipeline {
        &self.pipelines[id]
    }

    pub fn pipeline_mut(&mut self, id: PipelineId) -> &mut Pipeline {
        &mut self.pipelines[id]
    }

    pub fn num_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    /// Stages across all pipelines.
    pub fn num_stages(&self) -> usize {
        self.pipelines.iter().map(|p| p.num_stages()).sum()
    }

    pub fn new_pipeline(&mut self, parent: Option<PipelineId>) -> PipelineId {
        let id = self.pipelines.len();
        self.pipelines.push(Pipeline::new(id, parent));
        trace!(pipeline = %id, ?parent, "created pipeline");
        id
    }

    pub fn is_parallel(&self, pipeline: PipelineId) -> bool {
        self.pipelines[pipeline].is_parallel()
    }

    fn active_pipeline(&self, pipeline: PipelineId) -> ActivePipeline {
        match self.active.iter().rev().find(|a| a.pipeline == pipeline) {
            Some(active) => *active,
            None => panic!("pipeline {pipeline} is not being generated"),
        }
    }

    /// Pointer to pipeline local state at `offset`.
    ///
    /// Only valid in the function of `pipeline` itself.
    pub fn pipeline_state_ptr(&mut self, pipeline: PipelineId, offset: usize) -> ir::Value {
        let active = self.active_pipeline(pipeline);
        assert_eq!(
            active.depth,
            self.cg.function_depth(),
            "pipeline state accessed outside the pipeline's function"
        );

        if active.parallel {
            let base = self.cg.get_argument(1);
            return self.cg.ptr_add(base, offset as i64);
        }

        let state_id = match self.pipelines[pipeline].state_id() {
            Some(id) => id,
            None => panic!("pipeline {pipeline} has no registered state"),
        };
        let base = self.state_ptr(state_id);
        self.cg.ptr_add(base, offset as i64)
    }

    /// The worker context of a parallel pipeline.
    pub fn worker_context(&self, pipeline: PipelineId) -> ir::Value {
        let active = self.active_pipeline(pipeline);
        assert!(active.parallel, "pipeline {pipeline} is not parallel");
        assert_eq!(active.depth, self.cg.function_depth());
        self.cg.get_argument(2)
    }

    /// Pointer to the thread states of a parallel pipeline.
    pub fn thread_states_ptr(&mut self, pipeline: PipelineId) -> ir::Value {
        let p = &self.pipelines[pipeline];
        assert!(p.is_parallel(), "pipeline {pipeline} is not parallel");
        let state_id = match p.state_id() {
            Some(id) => id,
            None => panic!("pipeline {pipeline} has no thread states"),
        };
        self.state_ptr(state_id)
    }

    pub(crate) fn push_active(&mut self, active: ActivePipeline) {
        self.active.push(active);
    }

    pub(crate) fn pop_active(&mut self, pipeline: PipelineId) {
        match self.active.pop() {
            Some(active) if active.pipeline == pipeline => (),
            other => panic!("expected pipeline {pipeline} to be active, got {other:?}"),
        }
    }

    pub(crate) fn initialize_pipeline_state(&mut self, pipeline: PipelineId) -> Result<()> {
        let translators = self.pipelines[pipeline].translators().to_vec();
        for id in translators.into_iter().rev() {
            self.translator(id).initialize_pipeline_state(self, pipeline)?;
        }
        if self.pipelines[pipeline].parent().is_none() {
            let consumer = self.consumer;
            consumer.initialize_pipeline_state(self, pipeline)?;
        }
        Ok(())
    }

    pub(crate) fn finish_pipeline(&mut self, pipeline: PipelineId) -> Result<()> {
        let translators = self.pipelines[pipeline].translators().to_vec();
        for id in translators.into_iter().rev() {
            self.translator(id).finish_pipeline(self, pipeline)?;
        }
        Ok(())
    }

    /// Create the translator for `plan`, adding it to `pipeline`.
    pub fn prepare(&mut self, plan: &PlanNode, pipeline: PipelineId) -> Result<TranslatorId> {
        let id = self.translators.len();
        self.translators.push(None);
        self.pipelines[pipeline].add(id);

        let translator = create_translator(self, id, plan, pipeline)?;
        trace!(translator = %id, name = translator.name(), %pipeline, "prepared translator");
        self.translators[id] = Some(translator);
        Ok(id)
    }

    pub fn translator(&self, id: TranslatorId) -> Rc<dyn OperatorTranslator> {
        match &self.translators[id] {
            Some(translator) => translator.clone(),
            None => panic!("translator {id} is still being prepared"),
        }
    }

    pub fn produce(&mut self, id: TranslatorId) -> Result<()> {
        self.translator(id).produce(self)
    }

    /// Hand `row` from translator `from` to the next translator downstream
    /// in `pipeline`, or to the consumer at the end of the root pipeline.
    pub fn consume(&mut self, pipeline: PipelineId, from: TranslatorId, row: &[Value]) -> Result<()> {
        let p = &mut self.pipelines[pipeline];
        p.set_cursor(from);
        let is_root = p.parent().is_none();
        match p.next_step() {
            Some(next) => self.translator(next).consume(self, pipeline, row),
            None if is_root => {
                let consumer = self.consumer;
                consumer.consume_result(self, row)
            }
            None => Err(DbError::new("Rows pushed past the end of a pipeline")
                .with_field("pipeline", pipeline)
                .with_field("translator", from)),
        }
    }

    /// Generate `pipeline` with `body` producing its rows, and run it from the
    /// current function.
    pub fn run_pipeline<F>(&mut self, pipeline: PipelineId, body: F) -> Result<()>
    where
        F: FnOnce(&mut CompilationContext<'a>) -> Result<()>,
    {
        if self.is_parallel(pipeline) {
            Pipeline::run_parallel(self, pipeline, body)
        } else {
            Pipeline::run_serial(self, pipeline, body)
        }
    }

    /// Decide how each pipeline runs and lay out its state.
    fn finalize_pipelines(&mut self) {
        let workers = self.config.parallel_workers;
        for idx in 0..self.pipelines.len() {
            let pipeline = &self.pipelines[idx];
            let parallel = workers > 1
                && pipeline
                    .translators()
                    .iter()
                    .all(|t| self.translator(*t).supports_parallel(idx));
            let state_size = pipeline.state_size();

            let state_id = if parallel {
                Some(
                    self.runtime_state
                        .register(&format!("thread_states_{idx}"), THREAD_STATES_SIZE),
                )
            } else if state_size > 0 {
                Some(
                    self.runtime_state
                        .register(&format!("pipeline_state_{idx}"), state_size),
                )
            } else {
                None
            };

            let pipeline = &mut self.pipelines[idx];
            pipeline.set_parallel(parallel);
            if let Some(state_id) = state_id {
                pipeline.set_state_id(state_id);
            }
            debug!(pipeline = %idx, %parallel, %state_size, stages = pipeline.num_stages(), "finalized pipeline");
        }
    }

    fn parallel_pipelines(&self) -> Vec<PipelineId> {
        self.pipelines
            .iter()
            .filter(|p| p.is_parallel())
            .map(|p| p.id())
            .collect()
    }

    /// Generate the init, plan and tear down functions for `plan`.
    pub fn generate(&mut self, plan: &PlanNode) -> Result<QueryFunctions> {
        let root = self.new_pipeline(None);
        let root_translator = self.prepare(plan, root)?;
        self.finalize_pipelines();

        // Thread states come first, their init can't fail and tear down
        // relies on them being live.
        let func = FunctionBuilder::new(&mut self.cg, "init", &[PrimitiveType::VoidPtr], PrimitiveType::Void)?;
        for pipeline in self.parallel_pipelines() {
            let states = self.thread_states_ptr(pipeline);
            self.cg.call_runtime(RuntimeFunction::ThreadStatesInit, &[states]);
        }
        for id in 0..self.translators.len() {
            self.translator(id).initialize_query_state(self)?;
        }
        let init = func.return_and_finish(&mut self.cg, None);

        let func = FunctionBuilder::new(&mut self.cg, "plan", &[PrimitiveType::VoidPtr], PrimitiveType::Void)?;
        self.run_pipeline(root, |ctx| ctx.produce(root_translator))?;
        let plan = func.return_and_finish(&mut self.cg, None);

        let func = FunctionBuilder::new(&mut self.cg, "tearDown", &[PrimitiveType::VoidPtr], PrimitiveType::Void)?;
        for id in (0..self.translators.len()).rev() {
            self.translator(id).tear_down_query_state(self)?;
        }
        for pipeline in self.parallel_pipelines() {
            let states = self.thread_states_ptr(pipeline);
            self.cg.call_runtime(RuntimeFunction::ThreadStatesRelease, &[states]);
        }
        let tear_down = func.return_and_finish(&mut self.cg, None);

        debug!(
            pipelines = self.pipelines.len(),
            translators = self.translators.len(),
            runtime_state_size = self.runtime_state.size(),
            "generated query functions"
        );

        Ok(QueryFunctions { init, plan, tear_down })
    }
}
