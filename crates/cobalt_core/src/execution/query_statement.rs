use std::time::{Duration, Instant};

use cobalt_error::{DbError, Result};
use tracing::{debug, warn};

use super::compilation_context::{QueryFunctions, TableAccess};
use super::consumer::QueryResultConsumer;
use super::runtime_state::RuntimeState;
use crate::codegen::{CodeContext, FunctionDeclaration, PrimitiveType};
use crate::runtime::error::take_pending_error;
use crate::runtime::storage::Catalog;

/// Signature of the init, plan and tear down functions.
type QueryFunction = unsafe extern "C" fn(*mut u8);

/// Time spent in each phase of a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeStats {
    pub init: Duration,
    pub plan: Duration,
    pub tear_down: Duration,
}

#[derive(Debug, Clone, Copy)]
struct EntryPoints {
    init: QueryFunction,
    plan: QueryFunction,
    tear_down: QueryFunction,
}

/// A compiled query.
///
/// Owns the code context holding the query's machine code. `setup` compiles
/// the context once, after which the statement can be executed any number
/// of times.
#[derive(Debug)]
pub struct QueryStatement {
    code_context: CodeContext,
    functions: QueryFunctions,
    /// Bytes in the parameter block handed to every query function.
    parameter_size: usize,
    /// Kind of consumer the code was generated for.
    consumer_kind: &'static str,
    tables: Vec<TableAccess>,
    entry_points: Option<EntryPoints>,
}

impl QueryStatement {
    /// Create a statement from generated query functions.
    ///
    /// Every function must take a pointer to a parameter block of
    /// `parameter_size` bytes as its only argument. The first two pointer
    /// slots of the block are filled with the catalog and the consumer's
    /// state on execute, everything after is zeroed.
    pub fn new(
        code_context: CodeContext,
        functions: QueryFunctions,
        parameter_size: usize,
        consumer_kind: &'static str,
        tables: Vec<TableAccess>,
    ) -> Self {
        assert!(
            parameter_size >= RuntimeState::new().size() && parameter_size % 8 == 0,
            "invalid parameter block size {parameter_size}"
        );
        QueryStatement {
            code_context,
            functions,
            parameter_size,
            consumer_kind,
            tables,
            entry_points: None,
        }
    }

    pub fn parameter_size(&self) -> usize {
        self.parameter_size
    }

    pub fn functions(&self) -> &QueryFunctions {
        &self.functions
    }

    pub fn consumer_kind(&self) -> &'static str {
        self.consumer_kind
    }

    pub fn table_accesses(&self) -> &[TableAccess] {
        &self.tables
    }

    pub fn is_setup(&self) -> bool {
        self.entry_points.is_some()
    }

    /// Textual IR of every generated function.
    pub fn dump_ir(&self) -> String {
        self.code_context.dump_ir()
    }

    /// Compile the statement's code.
    pub fn setup(&mut self) -> Result<()> {
        if self.entry_points.is_some() {
            return Err(DbError::new("Query statement already set up"));
        }

        self.code_context.compile()?;
        let entry_points = EntryPoints {
            init: self.entry_point(&self.functions.init)?,
            plan: self.entry_point(&self.functions.plan)?,
            tear_down: self.entry_point(&self.functions.tear_down)?,
        };
        self.entry_points = Some(entry_points);

        debug!(
            context = %self.code_context.id(),
            parameter_size = %self.parameter_size,
            "set up query statement"
        );

        Ok(())
    }

    fn entry_point(&self, decl: &FunctionDeclaration) -> Result<QueryFunction> {
        if decl.params() != [PrimitiveType::VoidPtr] || decl.return_type() != PrimitiveType::Void {
            return Err(DbError::new("Query function must take the parameter block only")
                .with_field("function", decl.name()));
        }
        let ptr = self.code_context.get_function_pointer(decl)?;
        // SAFETY: The function was declared taking a single pointer and
        // returning nothing, and stays alive as long as the code context.
        Ok(unsafe { std::mem::transmute::<*const u8, QueryFunction>(ptr) })
    }

    /// Check every table the query reads still exists with the schema the
    /// code was generated for.
    fn validate_tables(&self, catalog: &Catalog) -> Result<()> {
        for access in &self.tables {
            let table = catalog
                .get_table(access.table_id)
                .ok_or_else(|| DbError::new("Missing table").with_field("table_id", access.table_id))?;
            if table.schema() != access.schema.as_slice() {
                return Err(DbError::new("Table schema changed since the query was compiled")
                    .with_field("table", table.name())
                    .with_field("expected", format!("{:?}", access.schema))
                    .with_field("actual", format!("{:?}", table.schema())));
            }
        }
        Ok(())
    }

    /// Execute the query, pushing its output into `consumer`.
    ///
    /// Tear down runs exactly once no matter which phase fails. Plan only
    /// runs if init succeeded.
    pub fn execute(
        &self,
        catalog: &Catalog,
        consumer: &dyn QueryResultConsumer,
        stats: Option<&mut RuntimeStats>,
    ) -> Result<()> {
        let entry_points = self
            .entry_points
            .ok_or_else(|| DbError::new("Query statement must be set up before execution"))?;
        if consumer.kind() != self.consumer_kind {
            return Err(DbError::new("Query compiled for a different kind of consumer")
                .with_field("expected", self.consumer_kind)
                .with_field("got", consumer.kind()));
        }
        self.validate_tables(catalog)?;

        // Leftover from some unrelated failure on this thread.
        if let Some(stale) = take_pending_error() {
            warn!(%stale, "discarding stale pending error");
        }

        let mut block = vec![0u64; self.parameter_size / 8];
        block[RuntimeState::CATALOG_OFFSET / 8] = catalog as *const Catalog as u64;
        block[RuntimeState::CONSUMER_STATE_OFFSET / 8] = consumer.state_ptr() as u64;
        let params = block.as_mut_ptr() as *mut u8;

        let init = match Self::run_phase("init", entry_points.init, params) {
            Ok(elapsed) => elapsed,
            Err(e) => {
                Self::tear_down_after_error(entry_points.tear_down, params);
                return Err(e);
            }
        };

        let plan = match Self::run_phase("plan", entry_points.plan, params) {
            Ok(elapsed) => elapsed,
            Err(e) => {
                Self::tear_down_after_error(entry_points.tear_down, params);
                return Err(e);
            }
        };

        let tear_down = Self::run_phase("tearDown", entry_points.tear_down, params)?;

        debug!(?init, ?plan, ?tear_down, "executed query statement");
        if let Some(stats) = stats {
            *stats = RuntimeStats { init, plan, tear_down };
        }

        Ok(())
    }

    fn run_phase(phase: &'static str, func: QueryFunction, params: *mut u8) -> Result<Duration> {
        let start = Instant::now();
        // SAFETY: `params` points to a zeroed parameter block of the size the
        // functions were generated for, with the catalog and consumer state
        // filled in.
        unsafe { func(params) };
        let elapsed = start.elapsed();

        match take_pending_error() {
            Some(e) => Err(e.with_field("phase", phase)),
            None => Ok(elapsed),
        }
    }

    /// Run tear down after a failed phase. The original error is the one
    /// reported, a tear down error is only logged.
    fn tear_down_after_error(func: QueryFunction, params: *mut u8) {
        if let Err(e) = Self::run_phase("tearDown", func, params) {
            warn!(%e, "tear down failed after query error");
        }
    }
}
