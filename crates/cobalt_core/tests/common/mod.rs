#![allow(dead_code)]

use cobalt_core::codegen::types::{Registry, Type};
use cobalt_core::config::CompilerConfig;
use cobalt_core::execution::{BufferingConsumer, CompileStats, CountingConsumer, QueryCompiler};
use cobalt_core::planner::PlanNode;
use cobalt_core::runtime::storage::Catalog;
use cobalt_core::scalar::ScalarValue;
use cobalt_error::Result;

/// Create a table and fill it with `rows`.
pub fn create_table(
    catalog: &mut Catalog,
    name: &str,
    schema: Vec<Type>,
    tile_group_size: usize,
    rows: &[Vec<ScalarValue>],
) -> u32 {
    let id = catalog.create_table(name, schema, tile_group_size).unwrap();
    let table = catalog.get_table_mut(id).unwrap();
    for row in rows {
        table.append_row(row).unwrap();
    }
    id
}

/// Compile and execute `plan`, returning all output rows.
pub fn run_query(catalog: &Catalog, plan: &PlanNode, config: CompilerConfig) -> Result<Vec<Vec<ScalarValue>>> {
    let registry = Registry::new();
    let compiler = QueryCompiler::new(&registry, config);
    let consumer = BufferingConsumer::new(plan.output_schema()?);
    let statement = compiler.compile(plan, &consumer)?;
    statement.execute(catalog, &consumer, None)?;
    Ok(consumer.take_rows())
}

/// Compile and execute `plan`, counting its output rows.
pub fn count_query(catalog: &Catalog, plan: &PlanNode, config: CompilerConfig) -> Result<u64> {
    let registry = Registry::new();
    let compiler = QueryCompiler::new(&registry, config);
    let consumer = CountingConsumer::new();
    let statement = compiler.compile(plan, &consumer)?;
    statement.execute(catalog, &consumer, None)?;
    Ok(consumer.count())
}

/// Compile `plan` without executing it.
pub fn compile_stats(plan: &PlanNode, config: CompilerConfig) -> CompileStats {
    let registry = Registry::new();
    let compiler = QueryCompiler::new(&registry, config);
    let consumer = CountingConsumer::new();
    let mut stats = CompileStats::default();
    compiler
        .compile_with_stats(plan, &consumer, Some(&mut stats))
        .unwrap();
    stats
}

/// Sort rows by their debug representation so results can be compared
/// independent of output order.
pub fn sorted(mut rows: Vec<Vec<ScalarValue>>) -> Vec<Vec<ScalarValue>> {
    rows.sort_by_cached_key(|row| format!("{row:?}"));
    rows
}

pub fn parallel_config(workers: usize) -> CompilerConfig {
    CompilerConfig {
        parallel_workers: workers,
        ..Default::default()
    }
}
