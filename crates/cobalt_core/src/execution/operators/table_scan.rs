use cobalt_error::{DbError, Result};
use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{self, InstBuilder};

use crate::codegen::lang::{Loop, Range, Vector, VectorizedLoop};
use crate::codegen::runtime_functions::RuntimeFunction;
use crate::codegen::types::{Type, TypeId};
use crate::codegen::{CodeGen, Value};
use crate::execution::compilation_context::CompilationContext;
use crate::execution::expression::evaluate_predicate;
use crate::execution::pipeline::{PipelineId, TranslatorId};
use crate::execution::translator::OperatorTranslator;
use crate::planner::Expression;
use crate::runtime::storage::{STR_REF_LEN_OFFSET, column_width};

/// Column arrays of the tile group being scanned.
#[derive(Debug, Clone, Copy)]
struct ColumnArrays {
    ty: Type,
    data: ir::Value,
    nulls: ir::Value,
}

/// Sequential scan over the tile groups of a table.
///
/// Rows are processed in batches. With a predicate, each batch first fills
/// a selection vector with the passing row indices, then pushes only the
/// selected rows downstream.
#[derive(Debug)]
pub struct TableScanTranslator {
    id: TranslatorId,
    pipeline: PipelineId,
    table_id: u32,
    /// Table columns read, in output order.
    columns: Vec<usize>,
    output_types: Vec<Type>,
    predicate: Option<Expression>,
}

impl TableScanTranslator {
    pub fn new(
        ctx: &mut CompilationContext,
        id: TranslatorId,
        pipeline: PipelineId,
        table_id: u32,
        schema: &[Type],
        columns: &[usize],
        predicate: Option<&Expression>,
    ) -> Result<Self> {
        let output_types = columns
            .iter()
            .map(|col| {
                schema.get(*col).copied().ok_or_else(|| {
                    DbError::new("Scanned column out of range")
                        .with_field("column", col)
                        .with_field("table", table_id)
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if let Some(predicate) = predicate {
            let ty = predicate.output_type(&output_types)?;
            if ty.type_id != TypeId::Boolean {
                return Err(DbError::new("Scan predicate must be boolean").with_field("type", ty));
            }
        }

        ctx.register_table_access(table_id, schema);

        Ok(TableScanTranslator {
            id,
            pipeline,
            table_id,
            columns: columns.to_vec(),
            output_types,
            predicate: predicate.cloned(),
        })
    }

    /// Load the columns of row `idx` from the column arrays.
    fn read_row(cg: &mut CodeGen, arrays: &[ColumnArrays], idx: ir::Value) -> Vec<Value> {
        arrays
            .iter()
            .map(|col| {
                let addr = cg.ptr_index(col.data, idx, column_width(col.ty.type_id));
                let (value, length) = match col.ty.type_id {
                    TypeId::Varchar => {
                        let ptr = cg.load(ir::types::I64, addr, 0);
                        let len = cg.load(ir::types::I32, addr, STR_REF_LEN_OFFSET as i32);
                        (ptr, Some(len))
                    }
                    type_id => {
                        let ty = match type_id.materialization().value.ir_type() {
                            Some(ty) => ty,
                            None => unreachable!("column types have a value register"),
                        };
                        (cg.load(ty, addr, 0), None)
                    }
                };
                let null = if col.ty.nullable {
                    let addr = cg.ptr_index(col.nulls, idx, 1);
                    Some(cg.load(ir::types::I8, addr, 0))
                } else {
                    None
                };
                Value::new(col.ty, value, length, null)
            })
            .collect()
    }

    /// Push the rows of one batch downstream.
    fn scan_batch(&self, ctx: &mut CompilationContext, arrays: &[ColumnArrays], range: Range) -> Result<()> {
        let batch_size = ctx.config().batch_size as u32;
        let predicate = match &self.predicate {
            Some(predicate) => predicate,
            None => {
                let cg = ctx.cg();
                let always = cg.const_bool(true);
                let mut rows = Loop::new(cg, always, &[range.start]);
                let idx = rows.loop_var(cg, 0);
                let row = Self::read_row(cg, arrays, idx);
                ctx.consume(self.pipeline, self.id, &row)?;

                let cg = ctx.cg();
                let next = cg.cursor().ins().iadd_imm(idx, 1);
                let more = cg.cursor().ins().icmp(IntCC::SignedLessThan, next, range.end);
                rows.loop_end(cg, more, &[next]);
                return Ok(());
            }
        };

        let cg = ctx.cg();
        let selection = Vector::new(cg, batch_size, "scan_selection");

        // Always write the index, only advance past it if the row passes.
        let zero = cg.const64(0);
        let always = cg.const_bool(true);
        let mut filter = Loop::new(cg, always, &[range.start, zero]);
        let idx = filter.loop_var(cg, 0);
        let count = filter.loop_var(cg, 1);
        let row = Self::read_row(cg, arrays, idx);
        let passes = evaluate_predicate(cg, predicate, &row)?;
        selection.set_value(cg, count, idx);
        let mut pos = cg.cursor();
        let passes = pos.ins().uextend(ir::types::I64, passes);
        let next_count = pos.ins().iadd(count, passes);
        let next_idx = pos.ins().iadd_imm(idx, 1);
        let more = pos.ins().icmp(IntCC::SignedLessThan, next_idx, range.end);
        filter.loop_end(cg, more, &[next_idx, next_count]);
        let num_selected = filter.collect_final_loop_vars(cg)[1];

        let zero = cg.const64(0);
        let any = cg.cursor().ins().icmp_imm(IntCC::SignedGreaterThan, num_selected, 0);
        let mut selected = Loop::new(cg, any, &[zero]);
        let pos = selected.loop_var(cg, 0);
        let idx = selection.get_value(cg, pos);
        let row = Self::read_row(cg, arrays, idx);
        ctx.consume(self.pipeline, self.id, &row)?;

        let cg = ctx.cg();
        let next = cg.cursor().ins().iadd_imm(pos, 1);
        let more = cg.cursor().ins().icmp(IntCC::SignedLessThan, next, num_selected);
        selected.loop_end(cg, more, &[next]);

        Ok(())
    }
}

impl OperatorTranslator for TableScanTranslator {
    fn name(&self) -> &'static str {
        "SeqScan"
    }

    fn produce(&self, ctx: &mut CompilationContext) -> Result<()> {
        let catalog = ctx.catalog_ptr();
        let worker = if ctx.is_parallel(self.pipeline) {
            Some(ctx.worker_context(self.pipeline))
        } else {
            None
        };
        let batch_size = ctx.config().batch_size as u32;

        let cg = ctx.cg();
        let table_id = cg.const32(self.table_id as i32);
        let table = cg.call_runtime_value(RuntimeFunction::CatalogGetTable, &[catalog, table_id]);
        let num_tile_groups = cg.call_runtime_value(RuntimeFunction::TableNumTileGroups, &[table]);

        // Parallel workers each scan a contiguous range of tile groups.
        let (start, end) = match worker {
            Some(worker) => (
                cg.call_runtime_value(RuntimeFunction::WorkerRangeStart, &[worker, num_tile_groups]),
                cg.call_runtime_value(RuntimeFunction::WorkerRangeEnd, &[worker, num_tile_groups]),
            ),
            None => (cg.const64(0), num_tile_groups),
        };

        let any = cg.cursor().ins().icmp(IntCC::SignedLessThan, start, end);
        let mut tile_groups = Loop::new(cg, any, &[start]);
        let tg_idx = tile_groups.loop_var(cg, 0);
        let tile_group = cg.call_runtime_value(RuntimeFunction::TableGetTileGroup, &[table, tg_idx]);
        let num_rows = cg.call_runtime_value(RuntimeFunction::TileGroupNumRows, &[tile_group]);

        let arrays = self
            .columns
            .iter()
            .zip(&self.output_types)
            .map(|(col, ty)| {
                let col = cg.const32(*col as i32);
                ColumnArrays {
                    ty: *ty,
                    data: cg.call_runtime_value(RuntimeFunction::TileGroupColumnData, &[tile_group, col]),
                    nulls: cg.call_runtime_value(RuntimeFunction::TileGroupColumnNulls, &[tile_group, col]),
                }
            })
            .collect::<Vec<_>>();

        let mut batches = VectorizedLoop::new(cg, num_rows, batch_size, &[]);
        let range = batches.current_range(cg);
        self.scan_batch(ctx, &arrays, range)?;
        batches.loop_end(ctx.cg(), &[]);

        let cg = ctx.cg();
        let next = cg.cursor().ins().iadd_imm(tg_idx, 1);
        let more = cg.cursor().ins().icmp(IntCC::SignedLessThan, next, end);
        tile_groups.loop_end(cg, more, &[next]);

        Ok(())
    }

    fn consume(&self, _ctx: &mut CompilationContext, _pipeline: PipelineId, _row: &[Value]) -> Result<()> {
        Err(DbError::new("Scan does not consume rows"))
    }

    fn supports_parallel(&self, _pipeline: PipelineId) -> bool {
        true
    }
}
