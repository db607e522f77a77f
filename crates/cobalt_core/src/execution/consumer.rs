//! Consumers receiving the rows produced by a compiled query.

use std::fmt;

use cobalt_error::{DbError, Result};
use cranelift_codegen::ir::{self, InstBuilder, MemFlags};

use super::compilation_context::CompilationContext;
use super::pipeline::PipelineId;
use crate::codegen::runtime_functions::RuntimeFunction;
use crate::codegen::types::{Type, TypeId};
use crate::codegen::{CodeGen, Value};
use crate::runtime::consumer::{
    BufferedResults,
    CountingResults,
    OUTPUT_SLOT_LEN_OFFSET,
    OUTPUT_SLOT_NULL_OFFSET,
    OUTPUT_SLOT_SIZE,
    OUTPUT_SLOT_VALUE_OFFSET,
};
use crate::scalar::ScalarValue;

/// Receives the output rows of a query.
///
/// A statement is compiled for one kind of consumer, and can then be
/// executed with any consumer of that kind. Consumers must tolerate being
/// handed rows from multiple workers at once.
pub trait QueryResultConsumer: fmt::Debug + Sync {
    /// Name of the consumer's kind, checked before executing a statement.
    fn kind(&self) -> &'static str;

    /// Check the consumer can accept rows of these types.
    fn prepare(&self, output_types: &[Type]) -> Result<()>;

    /// Emit code run at the start of the pipeline producing output rows.
    fn initialize_pipeline_state(&self, _ctx: &mut CompilationContext, _pipeline: PipelineId) -> Result<()> {
        Ok(())
    }

    /// Emit code handing a single output row to the consumer.
    fn consume_result(&self, ctx: &mut CompilationContext, row: &[Value]) -> Result<()>;

    /// Pointer to the consumer's state handed to generated code.
    fn state_ptr(&self) -> *mut u8;
}

/// Collects output rows as scalars.
#[derive(Debug)]
pub struct BufferingConsumer {
    results: BufferedResults,
}

impl BufferingConsumer {
    pub const KIND: &'static str = "buffering";

    pub fn new(output_types: Vec<Type>) -> Self {
        BufferingConsumer {
            results: BufferedResults::new(output_types),
        }
    }

    pub fn num_rows(&self) -> usize {
        self.results.num_rows()
    }

    /// Take all rows collected so far.
    pub fn take_rows(&self) -> Vec<Vec<ScalarValue>> {
        self.results.take_rows()
    }
}

impl QueryResultConsumer for BufferingConsumer {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn prepare(&self, output_types: &[Type]) -> Result<()> {
        let expected = self.results.types();
        let matches = expected.len() == output_types.len()
            && expected
                .iter()
                .zip(output_types)
                .all(|(a, b)| a.type_id == b.type_id);
        if !matches {
            return Err(DbError::new("Consumer types don't match the query's output")
                .with_field("consumer", format!("{expected:?}"))
                .with_field("query", format!("{output_types:?}")));
        }
        Ok(())
    }

    fn consume_result(&self, ctx: &mut CompilationContext, row: &[Value]) -> Result<()> {
        let state = ctx.consumer_state_ptr();
        let cg = ctx.cg();
        let slots = cg.allocate_bytes(OUTPUT_SLOT_SIZE * row.len().max(1), "output_slots");
        for (idx, value) in row.iter().enumerate() {
            write_output_slot(cg, slots, (idx * OUTPUT_SLOT_SIZE) as i32, value);
        }
        cg.call_runtime_checked(RuntimeFunction::BufferedConsumerAppend, &[state, slots]);
        Ok(())
    }

    fn state_ptr(&self) -> *mut u8 {
        &self.results as *const BufferedResults as *mut u8
    }
}

/// Write a value into an output slot at `offset` from `slots`.
fn write_output_slot(cg: &mut CodeGen, slots: ir::Value, offset: i32, value: &Value) {
    let raw = value.value();
    let wide = match value.type_id() {
        TypeId::Boolean => cg.cursor().ins().uextend(ir::types::I64, raw),
        TypeId::Double => cg.cursor().ins().bitcast(ir::types::I64, MemFlags::new(), raw),
        _ if cg.value_type(raw) == ir::types::I64 => raw,
        _ => cg.cursor().ins().sextend(ir::types::I64, raw),
    };
    cg.store(wide, slots, offset + OUTPUT_SLOT_VALUE_OFFSET as i32);

    let len = value.length_or_zero(cg);
    cg.store(len, slots, offset + OUTPUT_SLOT_LEN_OFFSET as i32);

    let null = value.is_null(cg);
    cg.store(null, slots, offset + OUTPUT_SLOT_NULL_OFFSET as i32);
}

/// Counts output rows without looking at them.
#[derive(Debug, Default)]
pub struct CountingConsumer {
    results: CountingResults,
}

impl CountingConsumer {
    pub const KIND: &'static str = "counting";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.results.count()
    }

    pub fn reset(&self) {
        self.results.reset()
    }
}

impl QueryResultConsumer for CountingConsumer {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn prepare(&self, _output_types: &[Type]) -> Result<()> {
        Ok(())
    }

    fn consume_result(&self, ctx: &mut CompilationContext, _row: &[Value]) -> Result<()> {
        let state = ctx.consumer_state_ptr();
        let cg = ctx.cg();
        let one = cg.const64(1);
        cg.call_runtime(RuntimeFunction::CountingConsumerAdd, &[state, one]);
        Ok(())
    }

    fn state_ptr(&self) -> *mut u8 {
        &self.results as *const CountingResults as *mut u8
    }
}
