mod common;

use cobalt_core::codegen::hash_table::HashTable;
use cobalt_core::codegen::runtime_functions::RuntimeFunction;
use cobalt_core::codegen::sorter::Sorter;
use cobalt_core::codegen::types::{Registry, Type, TypeId};
use cobalt_core::codegen::{CodeGen, CodegenOptions, FunctionBuilder, FunctionDeclaration, PrimitiveType};
use cobalt_core::config::CompilerConfig;
use cobalt_core::execution::{
    BufferingConsumer,
    CountingConsumer,
    QueryCompiler,
    QueryFunctions,
    QueryStatement,
    RuntimeState,
    RuntimeStats,
};
use cobalt_core::planner::{AggregateExpr, Expression, PlanNode, SortKey};
use cobalt_core::runtime::hash_table::HASH_TABLE_SIZE;
use cobalt_core::runtime::sorter::SORTER_SIZE;
use cobalt_core::runtime::storage::Catalog;
use cobalt_core::scalar::ScalarValue;
use common::{compile_stats, create_table};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    None,
    Init,
    Plan,
    TearDown,
}

/// Build a function adding `amount` to the counting consumer, then failing
/// if `fail` is set.
fn counting_function(cg: &mut CodeGen, name: &str, amount: i64, fail: bool) -> FunctionDeclaration {
    let func = FunctionBuilder::new(cg, name, &[PrimitiveType::VoidPtr], PrimitiveType::Void).unwrap();
    let runtime_state = func.argument(cg, 0);
    let state = RuntimeState::load_consumer_state(cg, runtime_state);
    let amount = cg.const64(amount);
    cg.call_runtime(RuntimeFunction::CountingConsumerAdd, &[state, amount]);
    if fail {
        let overflow = cg.const_bool(true);
        cg.throw_if_overflow(overflow);
    }
    func.return_and_finish(cg, None)
}

/// Statement where init adds 1, plan adds 10 and tear down adds 100 to the
/// consumer's count.
fn fault_statement(registry: &Registry, fault: Fault) -> QueryStatement {
    let mut cc = registry
        .code_context_factory()
        .create(CodegenOptions::default())
        .unwrap();
    let functions = {
        let mut cg = CodeGen::new(&mut cc, registry);
        QueryFunctions {
            init: counting_function(&mut cg, "init", 1, fault == Fault::Init),
            plan: counting_function(&mut cg, "plan", 10, fault == Fault::Plan),
            tear_down: counting_function(&mut cg, "tearDown", 100, fault == Fault::TearDown),
        }
    };
    let mut statement = QueryStatement::new(
        cc,
        functions,
        RuntimeState::new().size(),
        CountingConsumer::KIND,
        Vec::new(),
    );
    statement.setup().unwrap();
    statement
}

#[test]
fn all_phases_run_once() {
    logutil::init_test();
    let registry = Registry::new();
    let statement = fault_statement(&registry, Fault::None);
    let consumer = CountingConsumer::new();

    statement.execute(&Catalog::new(), &consumer, None).unwrap();
    assert_eq!(111, consumer.count());

    // Statements are reusable.
    statement.execute(&Catalog::new(), &consumer, None).unwrap();
    assert_eq!(222, consumer.count());
}

#[test]
fn init_failure_skips_plan_and_tears_down() {
    logutil::init_test();
    let registry = Registry::new();
    let statement = fault_statement(&registry, Fault::Init);
    let consumer = CountingConsumer::new();

    let err = statement.execute(&Catalog::new(), &consumer, None).unwrap_err();
    assert_eq!("Numeric value out of range", err.get_msg());
    assert_eq!(101, consumer.count());
}

#[test]
fn plan_failure_tears_down() {
    logutil::init_test();
    let registry = Registry::new();
    let statement = fault_statement(&registry, Fault::Plan);
    let consumer = CountingConsumer::new();

    let err = statement.execute(&Catalog::new(), &consumer, None).unwrap_err();
    assert_eq!("Numeric value out of range", err.get_msg());
    assert_eq!(111, consumer.count());
}

#[test]
fn tear_down_failure_reported() {
    logutil::init_test();
    let registry = Registry::new();
    let statement = fault_statement(&registry, Fault::TearDown);
    let consumer = CountingConsumer::new();

    let err = statement.execute(&Catalog::new(), &consumer, None).unwrap_err();
    assert_eq!("Numeric value out of range", err.get_msg());
    assert_eq!(111, consumer.count());
}

#[test]
fn tear_down_after_partial_init() {
    logutil::init_test();
    let registry = Registry::new();
    let schema = vec![Type::not_null(TypeId::Integer)];
    let sorter = Sorter::new(&schema);
    let table = HashTable::new(&schema, 8);

    let mut runtime_state = RuntimeState::new();
    let sorter_state = runtime_state.register("sorter", SORTER_SIZE);
    let table_state = runtime_state.register("table", HASH_TABLE_SIZE);

    let mut cc = registry
        .code_context_factory()
        .create(CodegenOptions::default())
        .unwrap();
    let functions = {
        let mut cg = CodeGen::new(&mut cc, &registry);

        // Init creates the sorter, then fails before the table exists.
        let init = FunctionBuilder::new(&mut cg, "init", &[PrimitiveType::VoidPtr], PrimitiveType::Void).unwrap();
        let state = init.argument(&mut cg, 0);
        let sorter_ptr = runtime_state.state_ptr(&mut cg, state, sorter_state);
        sorter.init(&mut cg, sorter_ptr);
        let overflow = cg.const_bool(true);
        cg.throw_if_overflow(overflow);
        let table_ptr = runtime_state.state_ptr(&mut cg, state, table_state);
        table.init(&mut cg, table_ptr, 16);
        let init = init.return_and_finish(&mut cg, None);

        let plan = counting_function(&mut cg, "plan", 10, false);

        let tear_down =
            FunctionBuilder::new(&mut cg, "tearDown", &[PrimitiveType::VoidPtr], PrimitiveType::Void).unwrap();
        let state = tear_down.argument(&mut cg, 0);
        let table_ptr = runtime_state.state_ptr(&mut cg, state, table_state);
        table.release(&mut cg, table_ptr);
        let sorter_ptr = runtime_state.state_ptr(&mut cg, state, sorter_state);
        sorter.release(&mut cg, sorter_ptr);
        let consumer_state = RuntimeState::load_consumer_state(&mut cg, state);
        let amount = cg.const64(100);
        cg.call_runtime(RuntimeFunction::CountingConsumerAdd, &[consumer_state, amount]);
        let tear_down = tear_down.return_and_finish(&mut cg, None);

        QueryFunctions { init, plan, tear_down }
    };
    let mut statement = QueryStatement::new(cc, functions, runtime_state.size(), CountingConsumer::KIND, Vec::new());
    statement.setup().unwrap();

    let consumer = CountingConsumer::new();
    let err = statement.execute(&Catalog::new(), &consumer, None).unwrap_err();
    assert_eq!("Numeric value out of range", err.get_msg());
    // Plan skipped, tear down ran past the uninitialized table.
    assert_eq!(100, consumer.count());

    // Nothing left behind for the next run.
    let err = statement.execute(&Catalog::new(), &consumer, None).unwrap_err();
    assert_eq!("Numeric value out of range", err.get_msg());
    assert_eq!(200, consumer.count());
}

#[test]
fn execute_requires_setup() {
    logutil::init_test();
    let registry = Registry::new();
    let mut cc = registry
        .code_context_factory()
        .create(CodegenOptions::default())
        .unwrap();
    let functions = {
        let mut cg = CodeGen::new(&mut cc, &registry);
        QueryFunctions {
            init: counting_function(&mut cg, "init", 1, false),
            plan: counting_function(&mut cg, "plan", 1, false),
            tear_down: counting_function(&mut cg, "tearDown", 1, false),
        }
    };
    let mut statement = QueryStatement::new(cc, functions, 16, CountingConsumer::KIND, Vec::new());
    let consumer = CountingConsumer::new();

    assert!(statement.execute(&Catalog::new(), &consumer, None).is_err());
    assert_eq!(0, consumer.count());

    statement.setup().unwrap();
    assert!(statement.setup().is_err());
    statement.execute(&Catalog::new(), &consumer, None).unwrap();
    assert_eq!(3, consumer.count());
}

fn int_table() -> (Catalog, u32) {
    let rows: Vec<_> = (0..10).map(|i| vec![ScalarValue::Int32(i)]).collect();
    let mut catalog = Catalog::new();
    let id = create_table(&mut catalog, "t", vec![Type::not_null(TypeId::Integer)], 4, &rows);
    (catalog, id)
}

#[test]
fn consumer_kind_mismatch() {
    logutil::init_test();
    let (catalog, id) = int_table();
    let plan = PlanNode::scan(id, vec![Type::not_null(TypeId::Integer)]);

    let registry = Registry::new();
    let compiler = QueryCompiler::new(&registry, CompilerConfig::default());
    let buffering = BufferingConsumer::new(vec![Type::not_null(TypeId::Integer)]);
    let statement = compiler.compile(&plan, &buffering).unwrap();

    let counting = CountingConsumer::new();
    let err = statement.execute(&catalog, &counting, None).unwrap_err();
    assert_eq!("Query compiled for a different kind of consumer", err.get_msg());
    assert_eq!(0, counting.count());

    statement.execute(&catalog, &buffering, None).unwrap();
    assert_eq!(10, buffering.num_rows());
}

#[test]
fn consumer_rejects_output_types() {
    logutil::init_test();
    let (_, id) = int_table();
    let plan = PlanNode::scan(id, vec![Type::not_null(TypeId::Integer)]);

    let registry = Registry::new();
    let compiler = QueryCompiler::new(&registry, CompilerConfig::default());
    let buffering = BufferingConsumer::new(vec![Type::not_null(TypeId::Varchar)]);
    assert!(compiler.compile(&plan, &buffering).is_err());
}

#[test]
fn table_schema_checked_on_execute() {
    logutil::init_test();
    let (catalog, id) = int_table();
    let plan = PlanNode::scan(id, vec![Type::not_null(TypeId::Integer)]);

    let registry = Registry::new();
    let compiler = QueryCompiler::new(&registry, CompilerConfig::default());
    let consumer = CountingConsumer::new();
    let statement = compiler.compile(&plan, &consumer).unwrap();
    statement.execute(&catalog, &consumer, None).unwrap();
    assert_eq!(10, consumer.count());

    let mut other = Catalog::new();
    create_table(&mut other, "t", vec![Type::not_null(TypeId::BigInt)], 4, &[]);
    let err = statement.execute(&other, &consumer, None).unwrap_err();
    assert_eq!("Table schema changed since the query was compiled", err.get_msg());

    let err = statement.execute(&Catalog::new(), &consumer, None).unwrap_err();
    assert_eq!("Missing table", err.get_msg());
    assert_eq!(10, consumer.count());
}

#[test]
fn runtime_stats_recorded() {
    logutil::init_test();
    let (catalog, id) = int_table();
    let plan = PlanNode::scan(id, vec![Type::not_null(TypeId::Integer)]);

    let registry = Registry::new();
    let compiler = QueryCompiler::new(&registry, CompilerConfig::default());
    let consumer = CountingConsumer::new();
    let statement = compiler.compile(&plan, &consumer).unwrap();

    let mut stats = RuntimeStats::default();
    statement.execute(&catalog, &consumer, Some(&mut stats)).unwrap();
    assert!(stats.plan > std::time::Duration::ZERO);
    assert_eq!(10, consumer.count());
}

#[test]
fn pipelines_and_stages() {
    logutil::init_test();
    let schema = vec![Type::not_null(TypeId::Integer)];

    let scan = PlanNode::scan(0, schema.clone());
    let stats = compile_stats(&scan, CompilerConfig::default());
    assert_eq!(1, stats.num_pipelines);
    assert_eq!(1, stats.num_stages);
    assert!(stats.num_functions >= 4);

    let projection = PlanNode::Projection {
        input: Box::new(scan.clone()),
        exprs: vec![Expression::column(0)],
    };
    let stats = compile_stats(&projection, CompilerConfig::default());
    assert_eq!(1, stats.num_pipelines);
    assert_eq!(1, stats.num_stages);

    // Order by over a hash join:
    //   root:  [OrderBy]
    //   sort:  [OrderBy | HashJoin, Scan]
    //   build: [HashJoin | Scan]
    let join = PlanNode::HashJoin {
        left: Box::new(scan.clone()),
        right: Box::new(scan.clone()),
        left_keys: vec![Expression::column(0)],
        right_keys: vec![Expression::column(0)],
    };
    let plan = PlanNode::OrderBy {
        input: Box::new(join),
        keys: vec![SortKey::asc(0)],
    };
    let stats = compile_stats(&plan, CompilerConfig::default());
    assert_eq!(3, stats.num_pipelines);
    assert_eq!(5, stats.num_stages);

    // Nested loop join: root, left and right pipelines, a boundary after
    // the join in the left pipeline only.
    let plan = PlanNode::NestedLoopJoin {
        left: Box::new(scan.clone()),
        right: Box::new(scan.clone()),
        predicate: None,
    };
    let stats = compile_stats(&plan, CompilerConfig::default());
    assert_eq!(3, stats.num_pipelines);
    assert_eq!(4, stats.num_stages);

    let plan = PlanNode::HashGroupBy {
        input: Box::new(scan),
        group_by: vec![Expression::column(0)],
        aggregates: vec![AggregateExpr::count_star()],
    };
    let stats = compile_stats(&plan, CompilerConfig::default());
    assert_eq!(2, stats.num_pipelines);
    assert_eq!(3, stats.num_stages);
}
