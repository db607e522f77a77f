mod common;

use std::collections::BTreeMap;

use cobalt_core::codegen::types::{BinaryOp, Type, TypeId};
use cobalt_core::config::CompilerConfig;
use cobalt_core::planner::{AggregateExpr, AggregateFunction, Expression, PlanNode};
use cobalt_core::runtime::storage::Catalog;
use cobalt_core::scalar::ScalarValue;
use common::{create_table, parallel_config, run_query, sorted};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn schema() -> Vec<Type> {
    vec![
        Type::not_null(TypeId::Integer),
        Type::nullable(TypeId::BigInt),
        Type::not_null(TypeId::Double),
        Type::not_null(TypeId::Varchar),
    ]
}

/// Group 9 never has a non-NULL value.
fn random_rows(n: usize) -> Vec<Vec<ScalarValue>> {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    (0..n)
        .map(|_| {
            let group: i32 = rng.random_range(0..10);
            let value = if group == 9 || rng.random_bool(0.2) {
                ScalarValue::Null
            } else {
                ScalarValue::Int64(rng.random_range(-1000..1000))
            };
            vec![
                ScalarValue::Int32(group),
                value,
                ScalarValue::Float64(rng.random_range(-10.0..10.0)),
                ScalarValue::Utf8(format!("v{}", rng.random_range(0..100))),
            ]
        })
        .collect()
}

#[derive(Debug, Default)]
struct Expected {
    count_star: i64,
    count: i64,
    sum: i64,
    min: Option<i64>,
    max: Option<i64>,
    double_sum: f64,
    max_str: Option<String>,
}

fn expected_groups(rows: &[Vec<ScalarValue>]) -> BTreeMap<i64, Expected> {
    let mut groups: BTreeMap<i64, Expected> = BTreeMap::new();
    for row in rows {
        let acc = groups.entry(row[0].try_as_i64().unwrap()).or_default();
        acc.count_star += 1;
        if let Ok(v) = row[1].try_as_i64() {
            acc.count += 1;
            acc.sum += v;
            acc.min = Some(acc.min.map_or(v, |m| m.min(v)));
            acc.max = Some(acc.max.map_or(v, |m| m.max(v)));
        }
        if let ScalarValue::Float64(d) = row[2] {
            acc.double_sum += d;
        }
        let s = row[3].try_as_str().unwrap().to_string();
        if acc.max_str.as_ref().is_none_or(|m| s > *m) {
            acc.max_str = Some(s);
        }
    }
    groups
}

fn or_null(v: Option<i64>) -> ScalarValue {
    v.map(ScalarValue::Int64).unwrap_or(ScalarValue::Null)
}

fn group_by_plan(table_id: u32) -> PlanNode {
    PlanNode::HashGroupBy {
        input: Box::new(PlanNode::scan(table_id, schema())),
        group_by: vec![Expression::column(0)],
        aggregates: vec![
            AggregateExpr::count_star(),
            AggregateExpr::new(AggregateFunction::Count, 1),
            AggregateExpr::new(AggregateFunction::Sum, 1),
            AggregateExpr::new(AggregateFunction::Min, 1),
            AggregateExpr::new(AggregateFunction::Max, 1),
            AggregateExpr::new(AggregateFunction::Avg, 2),
            AggregateExpr::new(AggregateFunction::Max, 3),
        ],
    }
}

fn check_groups(rows: Vec<Vec<ScalarValue>>, expected: &BTreeMap<i64, Expected>) {
    let mut rows = rows;
    rows.sort_by_key(|row| row[0].try_as_i64().unwrap());
    assert_eq!(expected.len(), rows.len());

    for (row, (group, exp)) in rows.iter().zip(expected) {
        assert_eq!(ScalarValue::Int32(*group as i32), row[0]);
        assert_eq!(ScalarValue::Int64(exp.count_star), row[1], "group {group}");
        assert_eq!(ScalarValue::Int64(exp.count), row[2], "group {group}");
        let sum = (exp.count > 0).then_some(exp.sum);
        assert_eq!(or_null(sum), row[3], "group {group}");
        assert_eq!(or_null(exp.min), row[4], "group {group}");
        assert_eq!(or_null(exp.max), row[5], "group {group}");

        let avg = exp.double_sum / exp.count_star as f64;
        match row[6] {
            ScalarValue::Float64(got) => assert!((got - avg).abs() < 1e-9, "group {group}: {got} != {avg}"),
            ref other => panic!("unexpected avg {other:?}"),
        }
        assert_eq!(
            ScalarValue::Utf8(exp.max_str.clone().unwrap()),
            row[7],
            "group {group}"
        );
    }
}

#[test]
fn group_by_all_aggregates() {
    logutil::init_test();
    let rows = random_rows(1000);
    let mut catalog = Catalog::new();
    let id = create_table(&mut catalog, "t", schema(), 128, &rows);

    let expected = expected_groups(&rows);
    assert!(expected[&9].count == 0);

    let out = run_query(&catalog, &group_by_plan(id), CompilerConfig::default()).unwrap();
    check_groups(out, &expected);
}

#[test]
fn group_by_many_groups_small_table() {
    logutil::init_test();
    // More groups than the initial capacity and the output batch size.
    let rows: Vec<_> = (0..5000)
        .map(|i| vec![ScalarValue::Int32(i % 1500), ScalarValue::Int64(i as i64)])
        .collect();
    let mut catalog = Catalog::new();
    let schema = vec![Type::not_null(TypeId::Integer), Type::not_null(TypeId::BigInt)];
    let id = create_table(&mut catalog, "t", schema.clone(), 1000, &rows);

    let plan = PlanNode::HashGroupBy {
        input: Box::new(PlanNode::scan(id, schema)),
        group_by: vec![Expression::column(0)],
        aggregates: vec![
            AggregateExpr::count_star(),
            AggregateExpr::new(AggregateFunction::Sum, 1),
        ],
    };
    let config = CompilerConfig {
        hash_table_initial_capacity: 4,
        batch_size: 100,
        ..Default::default()
    };

    let out = run_query(&catalog, &plan, config).unwrap();
    let expected: Vec<_> = (0..1500)
        .map(|g: i64| {
            let members: Vec<i64> = (0..5000).filter(|i| i % 1500 == g).collect();
            vec![
                ScalarValue::Int32(g as i32),
                ScalarValue::Int64(members.len() as i64),
                ScalarValue::Int64(members.iter().sum()),
            ]
        })
        .collect();
    assert_eq!(sorted(expected), sorted(out));
}

#[test]
fn group_by_with_parallel_config() {
    logutil::init_test();
    let rows = random_rows(500);
    let mut catalog = Catalog::new();
    let id = create_table(&mut catalog, "t", schema(), 16, &rows);

    let out = run_query(&catalog, &group_by_plan(id), parallel_config(4)).unwrap();
    check_groups(out, &expected_groups(&rows));
}

#[test]
fn group_by_expression_key() {
    logutil::init_test();
    let rows: Vec<_> = (0..100).map(|i| vec![ScalarValue::Int32(i)]).collect();
    let mut catalog = Catalog::new();
    let schema = vec![Type::not_null(TypeId::Integer)];
    let id = create_table(&mut catalog, "t", schema.clone(), 30, &rows);

    // SELECT x % 3, count(*), max(x) GROUP BY x % 3
    let plan = PlanNode::HashGroupBy {
        input: Box::new(PlanNode::scan(id, schema)),
        group_by: vec![Expression::arith(
            BinaryOp::Mod,
            Expression::column(0),
            Expression::constant(3),
        )],
        aggregates: vec![
            AggregateExpr::count_star(),
            AggregateExpr::new(AggregateFunction::Max, 0),
        ],
    };

    let out = run_query(&catalog, &plan, CompilerConfig::default()).unwrap();
    let expected = vec![
        vec![ScalarValue::Int32(0), ScalarValue::Int64(34), ScalarValue::Int32(99)],
        vec![ScalarValue::Int32(1), ScalarValue::Int64(33), ScalarValue::Int32(97)],
        vec![ScalarValue::Int32(2), ScalarValue::Int64(33), ScalarValue::Int32(98)],
    ];
    assert_eq!(sorted(expected), sorted(out));
}

#[test]
fn group_by_null_key_is_one_group() {
    logutil::init_test();
    let values = [Some(1), None, Some(1), None, Some(2)];
    let rows: Vec<_> = values
        .iter()
        .map(|v| vec![v.map(ScalarValue::Int64).unwrap_or(ScalarValue::Null)])
        .collect();
    let mut catalog = Catalog::new();
    let schema = vec![Type::nullable(TypeId::BigInt)];
    let id = create_table(&mut catalog, "t", schema.clone(), 2, &rows);

    let plan = PlanNode::HashGroupBy {
        input: Box::new(PlanNode::scan(id, schema)),
        group_by: vec![Expression::column(0)],
        aggregates: vec![AggregateExpr::count_star()],
    };

    let out = run_query(&catalog, &plan, CompilerConfig::default()).unwrap();
    let expected = vec![
        vec![ScalarValue::Int64(1), ScalarValue::Int64(2)],
        vec![ScalarValue::Null, ScalarValue::Int64(2)],
        vec![ScalarValue::Int64(2), ScalarValue::Int64(1)],
    ];
    assert_eq!(sorted(expected), sorted(out));
}

fn ungrouped_plan(table_id: u32) -> PlanNode {
    PlanNode::HashGroupBy {
        input: Box::new(PlanNode::scan(table_id, schema())),
        group_by: Vec::new(),
        aggregates: vec![
            AggregateExpr::count_star(),
            AggregateExpr::new(AggregateFunction::Sum, 1),
            AggregateExpr::new(AggregateFunction::Min, 3),
        ],
    }
}

#[test]
fn ungrouped_aggregate() {
    logutil::init_test();
    let rows = random_rows(300);
    let mut catalog = Catalog::new();
    let id = create_table(&mut catalog, "t", schema(), 64, &rows);

    let sum: i64 = rows.iter().filter_map(|row| row[1].try_as_i64().ok()).sum();
    let min = rows
        .iter()
        .map(|row| row[3].try_as_str().unwrap().to_string())
        .min()
        .unwrap();

    let out = run_query(&catalog, &ungrouped_plan(id), CompilerConfig::default()).unwrap();
    assert_eq!(
        vec![vec![ScalarValue::Int64(300), ScalarValue::Int64(sum), ScalarValue::Utf8(min)]],
        out
    );
}

#[test]
fn ungrouped_aggregate_empty_input() {
    logutil::init_test();
    let mut catalog = Catalog::new();
    let id = create_table(&mut catalog, "t", schema(), 64, &[]);

    let out = run_query(&catalog, &ungrouped_plan(id), CompilerConfig::default()).unwrap();
    assert_eq!(
        vec![vec![ScalarValue::Int64(0), ScalarValue::Null, ScalarValue::Null]],
        out
    );

    // With grouping keys there's nothing to output.
    let out = run_query(&catalog, &group_by_plan(id), CompilerConfig::default()).unwrap();
    assert!(out.is_empty());
}

#[test]
fn sum_overflow_fails_query() {
    logutil::init_test();
    let rows = vec![
        vec![ScalarValue::Int32(1), ScalarValue::Int64(i64::MAX)],
        vec![ScalarValue::Int32(1), ScalarValue::Int64(1)],
    ];
    let schema = vec![Type::not_null(TypeId::Integer), Type::not_null(TypeId::BigInt)];
    let mut catalog = Catalog::new();
    let id = create_table(&mut catalog, "t", schema.clone(), 64, &rows);

    let plan = PlanNode::HashGroupBy {
        input: Box::new(PlanNode::scan(id, schema)),
        group_by: vec![Expression::column(0)],
        aggregates: vec![AggregateExpr::new(AggregateFunction::Sum, 1)],
    };
    let err = run_query(&catalog, &plan, CompilerConfig::default()).unwrap_err();
    assert_eq!("Numeric value out of range", err.get_msg());
}
