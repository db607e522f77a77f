mod common;

use cobalt_core::codegen::types::{BinaryOp, ComparisonOp, Type, TypeId};
use cobalt_core::config::CompilerConfig;
use cobalt_core::planner::{Expression, PlanNode};
use cobalt_core::runtime::storage::Catalog;
use cobalt_core::scalar::ScalarValue;
use common::{count_query, create_table, parallel_config, run_query, sorted};

const NUM_ROWS: i64 = 2500;

fn schema() -> Vec<Type> {
    vec![
        Type::not_null(TypeId::Integer),
        Type::nullable(TypeId::BigInt),
        Type::nullable(TypeId::Varchar),
    ]
}

fn long_col(i: i64) -> ScalarValue {
    if i % 7 == 0 {
        ScalarValue::Null
    } else {
        ScalarValue::Int64(i * 10)
    }
}

fn str_col(i: i64) -> ScalarValue {
    if i % 5 == 0 {
        ScalarValue::Null
    } else {
        ScalarValue::Utf8(format!("s{i}"))
    }
}

fn test_catalog(tile_group_size: usize) -> (Catalog, u32) {
    let rows: Vec<_> = (0..NUM_ROWS)
        .map(|i| vec![ScalarValue::Int32(i as i32), long_col(i), str_col(i)])
        .collect();
    let mut catalog = Catalog::new();
    let id = create_table(&mut catalog, "t", schema(), tile_group_size, &rows);
    (catalog, id)
}

fn scan(table_id: u32, columns: Vec<usize>, predicate: Option<Expression>) -> PlanNode {
    PlanNode::SeqScan {
        table_id,
        schema: schema(),
        columns,
        predicate,
    }
}

/// `SELECT c0 + 1, c2, c1 * 2 FROM t WHERE c0 < 100 AND NOT c1 IS NULL`
fn filter_project_plan(table_id: u32) -> PlanNode {
    let predicate = Expression::and(
        Expression::lt(Expression::column(0), Expression::constant(100)),
        Expression::not(Expression::is_null(Expression::column(1))),
    );
    PlanNode::Projection {
        input: Box::new(scan(table_id, vec![0, 1, 2], Some(predicate))),
        exprs: vec![
            Expression::arith(BinaryOp::Add, Expression::column(0), Expression::constant(1)),
            Expression::column(2),
            Expression::arith(BinaryOp::Mul, Expression::column(1), Expression::constant(2i64)),
        ],
    }
}

fn filter_project_expected() -> Vec<Vec<ScalarValue>> {
    (0..100)
        .filter(|i| i % 7 != 0)
        .map(|i| vec![ScalarValue::Int32(i as i32 + 1), str_col(i), ScalarValue::Int64(i * 20)])
        .collect()
}

#[test]
fn scan_all_rows() {
    logutil::init_test();
    let (catalog, id) = test_catalog(1000);

    let rows = run_query(&catalog, &PlanNode::scan(id, schema()), CompilerConfig::default()).unwrap();
    assert_eq!(NUM_ROWS as usize, rows.len());
    for (i, row) in rows.iter().enumerate() {
        let i = i as i64;
        assert_eq!(&vec![ScalarValue::Int32(i as i32), long_col(i), str_col(i)], row);
    }
}

#[test]
fn filter_and_project() {
    logutil::init_test();
    let (catalog, id) = test_catalog(1000);

    let rows = run_query(&catalog, &filter_project_plan(id), CompilerConfig::default()).unwrap();
    assert_eq!(filter_project_expected(), rows);
}

#[test]
fn filter_with_small_batches() {
    logutil::init_test();
    let (catalog, id) = test_catalog(300);
    let config = CompilerConfig {
        batch_size: 7,
        ..Default::default()
    };

    let rows = run_query(&catalog, &filter_project_plan(id), config).unwrap();
    assert_eq!(filter_project_expected(), rows);
}

#[test]
fn scan_column_subset() {
    logutil::init_test();
    let (catalog, id) = test_catalog(1000);

    let predicate = Expression::compare(ComparisonOp::GtEq, Expression::column(1), Expression::constant(2490));
    let plan = scan(id, vec![2, 0], Some(predicate));

    let rows = run_query(&catalog, &plan, CompilerConfig::default()).unwrap();
    let expected: Vec<_> = (2490..NUM_ROWS)
        .map(|i| vec![str_col(i), ScalarValue::Int32(i as i32)])
        .collect();
    assert_eq!(expected, rows);
}

#[test]
fn filter_three_valued_or() {
    logutil::init_test();
    let (catalog, id) = test_catalog(1000);

    // NULL OR true passes, NULL OR false doesn't.
    let predicate = Expression::or(
        Expression::gt(Expression::column(1), Expression::constant(20000i64)),
        Expression::lt(Expression::column(0), Expression::constant(3)),
    );
    let plan = scan(id, vec![0, 1], Some(predicate));

    let rows = run_query(&catalog, &plan, CompilerConfig::default()).unwrap();
    let expected: Vec<_> = (0..NUM_ROWS)
        .filter(|i| *i < 3 || (i % 7 != 0 && i * 10 > 20000))
        .map(|i| vec![ScalarValue::Int32(i as i32), long_col(i)])
        .collect();
    assert_eq!(expected, rows);

    // Row 0 has a NULL c1 and passes through the OR's right side, row 7
    // has a NULL c1 and doesn't.
    assert_eq!(vec![ScalarValue::Int32(0), ScalarValue::Null], rows[0]);
    assert!(!rows.iter().any(|row| row[0] == ScalarValue::Int32(7)));
    assert!(rows.iter().any(|row| row[0] == ScalarValue::Int32(2003)));
}

#[test]
fn parallel_filter_and_project() {
    logutil::init_test();
    let (catalog, id) = test_catalog(100);

    let rows = run_query(&catalog, &filter_project_plan(id), parallel_config(4)).unwrap();
    assert_eq!(sorted(filter_project_expected()), sorted(rows));
}

#[test]
fn parallel_count() {
    logutil::init_test();
    let (catalog, id) = test_catalog(64);

    let plan = scan(id, vec![2], Some(Expression::is_null(Expression::column(0))));
    let count = count_query(&catalog, &plan, parallel_config(4)).unwrap();
    assert_eq!(500, count);

    let count = count_query(&catalog, &PlanNode::scan(id, schema()), parallel_config(3)).unwrap();
    assert_eq!(NUM_ROWS as u64, count);
}

#[test]
fn empty_table() {
    logutil::init_test();
    let mut catalog = Catalog::new();
    let id = create_table(&mut catalog, "empty", schema(), 10, &[]);

    let rows = run_query(&catalog, &PlanNode::scan(id, schema()), CompilerConfig::default()).unwrap();
    assert!(rows.is_empty());
    let count = count_query(&catalog, &PlanNode::scan(id, schema()), parallel_config(4)).unwrap();
    assert_eq!(0, count);
}

#[test]
fn overflow_fails_query() {
    logutil::init_test();
    let (catalog, id) = test_catalog(1000);

    let plan = PlanNode::Projection {
        input: Box::new(PlanNode::scan(id, schema())),
        exprs: vec![Expression::arith(
            BinaryOp::Mul,
            Expression::column(0),
            Expression::constant(i32::MAX),
        )],
    };
    let err = run_query(&catalog, &plan, CompilerConfig::default()).unwrap_err();
    assert_eq!("Numeric value out of range", err.get_msg());

    // Nothing left behind for the next query on this thread.
    let rows = run_query(&catalog, &filter_project_plan(id), CompilerConfig::default()).unwrap();
    assert_eq!(filter_project_expected(), rows);
}

#[test]
fn divide_by_zero_fails_query() {
    logutil::init_test();
    let (catalog, id) = test_catalog(1000);

    let plan = PlanNode::Projection {
        input: Box::new(PlanNode::scan(id, schema())),
        exprs: vec![Expression::arith(
            BinaryOp::Div,
            Expression::column(0),
            Expression::constant(0),
        )],
    };
    let err = run_query(&catalog, &plan, CompilerConfig::default()).unwrap_err();
    assert_eq!("Division by zero", err.get_msg());
}

#[test]
fn parallel_overflow_fails_query() {
    logutil::init_test();
    let (catalog, id) = test_catalog(100);

    let plan = PlanNode::Projection {
        input: Box::new(PlanNode::scan(id, schema())),
        exprs: vec![Expression::arith(
            BinaryOp::Add,
            Expression::column(0),
            Expression::constant(i32::MAX - 2000),
        )],
    };
    let err = run_query(&catalog, &plan, parallel_config(4)).unwrap_err();
    assert_eq!("Numeric value out of range", err.get_msg());
}
