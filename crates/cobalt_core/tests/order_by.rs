mod common;

use std::cmp::Ordering;

use cobalt_core::codegen::types::{Type, TypeId};
use cobalt_core::config::CompilerConfig;
use cobalt_core::planner::{Expression, PlanNode, SortKey};
use cobalt_core::runtime::storage::Catalog;
use cobalt_core::scalar::ScalarValue;
use common::{create_table, parallel_config, run_query};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn schema() -> Vec<Type> {
    vec![
        Type::nullable(TypeId::Integer),
        Type::not_null(TypeId::Varchar),
        Type::not_null(TypeId::Double),
    ]
}

/// Rows with unique string keys so every ordering is total.
fn random_rows(n: usize) -> Vec<Vec<ScalarValue>> {
    let mut rng = ChaCha8Rng::seed_from_u64(23);
    let mut rows: Vec<_> = (0..n)
        .map(|i| {
            let a = if rng.random_bool(0.1) {
                ScalarValue::Null
            } else {
                ScalarValue::Int32(rng.random_range(-20..20))
            };
            vec![
                a,
                ScalarValue::Utf8(format!("k{i:05}")),
                ScalarValue::Float64(rng.random_range(-1.0..1.0)),
            ]
        })
        .collect();
    rows.shuffle(&mut rng);
    rows
}

fn int_or_null(v: &ScalarValue) -> Option<i64> {
    v.try_as_i64().ok()
}

/// NULLs sort last ascending, which makes them first descending.
fn compare_nullable(a: Option<i64>, b: Option<i64>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a.cmp(&b),
    }
}

fn load(rows: &[Vec<ScalarValue>]) -> (Catalog, u32) {
    let mut catalog = Catalog::new();
    let id = create_table(&mut catalog, "t", schema(), 100, rows);
    (catalog, id)
}

#[test]
fn order_by_two_keys() {
    logutil::init_test();
    let rows = random_rows(1000);
    let (catalog, id) = load(&rows);

    // ORDER BY a DESC, b ASC
    let plan = PlanNode::OrderBy {
        input: Box::new(PlanNode::scan(id, schema())),
        keys: vec![SortKey::desc(0), SortKey::asc(1)],
    };
    let out = run_query(&catalog, &plan, CompilerConfig::default()).unwrap();

    let mut expected = rows.clone();
    expected.sort_by(|x, y| {
        compare_nullable(int_or_null(&y[0]), int_or_null(&x[0]))
            .then_with(|| x[1].try_as_str().unwrap().cmp(y[1].try_as_str().unwrap()))
    });
    assert_eq!(expected, out);
    assert!(out[0][0].is_null());
}

#[test]
fn order_by_double_ascending() {
    logutil::init_test();
    let rows = random_rows(300);
    let (catalog, id) = load(&rows);

    let plan = PlanNode::OrderBy {
        input: Box::new(PlanNode::scan(id, schema())),
        keys: vec![SortKey::asc(2)],
    };
    let out = run_query(&catalog, &plan, parallel_config(4)).unwrap();

    let as_f64 = |row: &Vec<ScalarValue>| match row[2] {
        ScalarValue::Float64(v) => v,
        ref other => panic!("unexpected value {other:?}"),
    };
    let mut expected = rows.clone();
    expected.sort_by(|x, y| as_f64(x).total_cmp(&as_f64(y)));
    assert_eq!(expected, out);
}

#[test]
fn order_by_nulls_last_ascending() {
    logutil::init_test();
    let rows = random_rows(200);
    let (catalog, id) = load(&rows);

    let plan = PlanNode::OrderBy {
        input: Box::new(PlanNode::scan(id, schema())),
        keys: vec![SortKey::asc(0), SortKey::desc(1)],
    };
    let out = run_query(&catalog, &plan, CompilerConfig::default()).unwrap();

    let mut expected = rows.clone();
    expected.sort_by(|x, y| {
        compare_nullable(int_or_null(&x[0]), int_or_null(&y[0]))
            .then_with(|| y[1].try_as_str().unwrap().cmp(x[1].try_as_str().unwrap()))
    });
    assert_eq!(expected, out);
    assert!(out.last().unwrap()[0].is_null());
}

#[test]
fn order_by_over_filter() {
    logutil::init_test();
    let rows = random_rows(500);
    let (catalog, id) = load(&rows);

    let plan = PlanNode::OrderBy {
        input: Box::new(PlanNode::SeqScan {
            table_id: id,
            schema: schema(),
            columns: vec![1, 0],
            predicate: Some(Expression::gt(Expression::column(1), Expression::constant(15))),
        }),
        keys: vec![SortKey::asc(0)],
    };
    let out = run_query(&catalog, &plan, CompilerConfig::default()).unwrap();

    let mut expected: Vec<_> = rows
        .iter()
        .filter(|row| int_or_null(&row[0]).is_some_and(|a| a > 15))
        .map(|row| vec![row[1].clone(), row[0].clone()])
        .collect();
    expected.sort_by(|x, y| x[0].try_as_str().unwrap().cmp(y[0].try_as_str().unwrap()));
    assert_eq!(expected, out);
}

#[test]
fn order_by_empty_input() {
    logutil::init_test();
    let (catalog, id) = load(&[]);

    let plan = PlanNode::OrderBy {
        input: Box::new(PlanNode::scan(id, schema())),
        keys: vec![SortKey::asc(0)],
    };
    assert!(run_query(&catalog, &plan, CompilerConfig::default()).unwrap().is_empty());
}

#[test]
fn order_by_key_out_of_range() {
    logutil::init_test();
    let (catalog, id) = load(&[]);

    let plan = PlanNode::OrderBy {
        input: Box::new(PlanNode::scan(id, schema())),
        keys: vec![SortKey::asc(3)],
    };
    let err = run_query(&catalog, &plan, CompilerConfig::default()).unwrap_err();
    assert_eq!("Sort key out of range", err.get_msg());
}

/// NaN sorts after every number and equal to itself.
fn compare_doubles(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap(),
    }
}

#[test]
fn order_by_double_with_nan_and_ties() {
    logutil::init_test();
    let schema = vec![Type::not_null(TypeId::Double), Type::not_null(TypeId::Integer)];
    let values: Vec<f64> = (0..2000)
        .map(|i| match i % 3 {
            0 => f64::NAN,
            1 => ((i * 7919) % 11) as f64 - 5.0,
            _ if i % 100 == 2 => f64::INFINITY,
            _ if i % 100 == 5 => f64::NEG_INFINITY,
            _ => ((i * 104729) % 1000) as f64 / 8.0,
        })
        .collect();
    let mut rows: Vec<_> = values
        .iter()
        .enumerate()
        .map(|(i, v)| vec![ScalarValue::Float64(*v), ScalarValue::Int32(i as i32)])
        .collect();
    rows.shuffle(&mut ChaCha8Rng::seed_from_u64(31));

    let mut catalog = Catalog::new();
    let id = create_table(&mut catalog, "t", schema.clone(), 300, &rows);

    let ids = |rows: &[Vec<ScalarValue>]| -> Vec<i64> { rows.iter().map(|r| r[1].try_as_i64().unwrap()).collect() };
    let id_of = |i: &i64| values[*i as usize];

    // Ties on the double are broken by the id so the expected order is
    // unique.
    for descending in [false, true] {
        let key = if descending { SortKey::desc(0) } else { SortKey::asc(0) };
        let plan = PlanNode::OrderBy {
            input: Box::new(PlanNode::scan(id, schema.clone())),
            keys: vec![key, SortKey::asc(1)],
        };
        let out = run_query(&catalog, &plan, CompilerConfig::default()).unwrap();

        let mut expected: Vec<i64> = (0..values.len() as i64).collect();
        expected.sort_by(|a, b| {
            let ord = compare_doubles(id_of(a), id_of(b));
            let ord = if descending { ord.reverse() } else { ord };
            ord.then_with(|| a.cmp(b))
        });
        assert_eq!(expected, ids(&out), "descending: {descending}");

        let first_is_nan = id_of(&ids(&out)[0]).is_nan();
        let last_is_nan = id_of(ids(&out).last().unwrap()).is_nan();
        assert_eq!(descending, first_is_nan);
        assert_eq!(!descending, last_is_nan);
    }
}
