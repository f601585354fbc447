//! Table store queries, with and without secondary indexes.

use cask_core::{
    IndexKind, IndexSpec, OpenMode, OrderType, QueryOp, SetOp, TableDb, columns,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use tempfile::{TempDir, tempdir};

fn people() -> (TempDir, TableDb) {
    let dir = tempdir().unwrap();
    let db = TableDb::new();
    db.open(dir.path().join("people.tct"), OpenMode::WRITER | OpenMode::CREATE)
        .unwrap();
    let rows = [
        ("1", "alice", "31", "admin staff", "likes rust and tea"),
        ("2", "bob", "17", "staff", "plays go"),
        ("3", "carol", "25", "guest", "writes rust daily"),
        ("4", "dave", "42", "admin", "drinks tea"),
        ("5", "erin", "25", "staff guest", "knows go and rust"),
    ];
    for (pk, name, age, roles, bio) in rows {
        db.put(
            pk.as_bytes(),
            &columns([("name", name), ("age", age), ("roles", roles), ("bio", bio)]),
        )
        .unwrap();
    }
    (dir, db)
}

fn strings(keys: Vec<Vec<u8>>) -> Vec<String> {
    keys.into_iter()
        .map(|k| String::from_utf8(k).unwrap())
        .collect()
}

#[test]
fn indexed_and_scanned_queries_agree() {
    let (_dir, db) = people();
    let cases: Vec<(&str, QueryOp, &str)> = vec![
        ("age", QueryOp::NumBt, "20 35"),
        ("age", QueryOp::NumGe, "25"),
        ("name", QueryOp::StrBw, "c"),
        ("roles", QueryOp::StrAnd, "staff guest"),
        ("roles", QueryOp::StrOr, "admin guest"),
        ("bio", QueryOp::FtsPh, "rust"),
        ("bio", QueryOp::FtsEx, "rust !!tea || drinks"),
    ];

    let scanned: Vec<_> = cases
        .iter()
        .map(|(column, op, operand)| {
            let mut query = db.query().unwrap();
            query.add_cond(column, *op, operand).unwrap();
            let mut keys = query.search().unwrap();
            keys.sort();
            keys
        })
        .collect();

    db.setindex("age", IndexSpec::new(IndexKind::Decimal)).unwrap();
    db.setindex("name", IndexSpec::new(IndexKind::Lexical)).unwrap();
    db.setindex("roles", IndexSpec::new(IndexKind::Token)).unwrap();
    db.setindex("bio", IndexSpec::new(IndexKind::QGram)).unwrap();

    for ((column, op, operand), expected) in cases.iter().zip(scanned) {
        let mut indexed = db.query().unwrap();
        indexed.add_cond(column, *op, operand).unwrap();
        assert!(
            indexed.plan().unwrap().starts_with("index"),
            "{column} {op} should use its index"
        );
        let mut keys = indexed.search().unwrap();
        keys.sort();
        assert_eq!(keys, expected, "{column} {op} {operand}");

        let mut bypass = db.query().unwrap();
        bypass.add_cond(column, op.no_index(), operand).unwrap();
        assert!(bypass.plan().unwrap().starts_with("full scan"));
        let mut keys = bypass.search().unwrap();
        keys.sort();
        assert_eq!(keys, expected, "{column} {op} {operand} without index");
    }
}

#[test]
fn ordered_search_with_limit() {
    let (_dir, db) = people();
    let mut query = db.query().unwrap();
    query.add_cond("roles", QueryOp::StrOr, "staff admin").unwrap();
    query.set_order("age", OrderType::NumDesc);
    query.set_limit(Some(2), 1);
    assert_eq!(strings(query.search().unwrap()), vec!["1", "5"]);
    assert_eq!(query.count().unwrap(), 2);
}

#[test]
fn negated_conditions() {
    let (_dir, db) = people();
    let mut query = db.query().unwrap();
    query.add_cond("bio", QueryOp::StrInc.negate(), "rust").unwrap();
    query.set_order("", OrderType::StrAsc);
    assert_eq!(strings(query.search().unwrap()), vec!["2", "4"]);
}

#[test]
fn metasearch_combines_queries() {
    let (_dir, db) = people();
    let mut young = db.query().unwrap();
    young.add_cond("age", QueryOp::NumLt, "30").unwrap();
    young.set_order("name", OrderType::StrAsc);
    let mut staff = db.query().unwrap();
    staff.add_cond("roles", QueryOp::StrAnd, "staff").unwrap();

    assert_eq!(
        strings(db.metasearch(&[&young, &staff], SetOp::Union).unwrap()),
        vec!["1", "2", "3", "5"]
    );
    assert_eq!(
        strings(db.metasearch(&[&young, &staff], SetOp::Intersect).unwrap()),
        vec!["2", "5"]
    );
    assert_eq!(
        strings(db.metasearch(&[&young, &staff], SetOp::Difference).unwrap()),
        vec!["3"]
    );
    assert!(db.metasearch(&[], SetOp::Union).unwrap().is_empty());
}

#[test]
fn aborted_transaction_restores_records_and_indexes() {
    let (_dir, db) = people();
    db.setindex("age", IndexSpec::new(IndexKind::Decimal)).unwrap();

    db.tranbegin().unwrap();
    db.put(b"6", &columns([("name", "frank"), ("age", "25")])).unwrap();
    db.out(b"3").unwrap();
    let mut everyone = db.query().unwrap();
    everyone.add_cond("age", QueryOp::NumGe, "0").unwrap();
    assert_eq!(everyone.search_out().unwrap(), 5);
    assert_eq!(db.rnum().unwrap(), 0);
    db.tranabort().unwrap();

    let mut query = db.query().unwrap();
    query.add_cond("age", QueryOp::NumEq, "25").unwrap();
    query.set_order("", OrderType::StrAsc);
    assert_eq!(strings(query.search().unwrap()), vec!["3", "5"]);
    assert_eq!(db.rnum().unwrap(), 5);
}

#[test]
fn copy_keeps_records_and_index_declarations() {
    let (dir, db) = people();
    db.setindex("name", IndexSpec::new(IndexKind::Lexical)).unwrap();
    let copy_path = dir.path().join("copy.tct");
    db.copy(&copy_path).unwrap();

    let copy = TableDb::new();
    copy.open(&copy_path, OpenMode::READER).unwrap();
    assert_eq!(copy.rnum().unwrap(), 5);
    assert_eq!(copy.get(b"4").unwrap(), db.get(b"4").unwrap());
    let info = copy.indexes().unwrap();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].column, "name");
    assert!(info[0].built);

    let mut query = copy.query().unwrap();
    query.add_cond("name", QueryOp::StrEq, "dave").unwrap();
    assert_eq!(strings(query.search().unwrap()), vec!["4"]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn numeric_between_agrees_with_scan(
        ages in prop::collection::vec(-50i32..150, 1..60),
        low in -60i32..160,
        high in -60i32..160,
    ) {
        let dir = tempdir().unwrap();
        let db = TableDb::new();
        db.open(dir.path().join("ages.tct"), OpenMode::WRITER | OpenMode::CREATE).unwrap();
        db.setindex("age", IndexSpec::new(IndexKind::Decimal)).unwrap();
        for (i, age) in ages.iter().enumerate() {
            db.put(i.to_string().as_bytes(), &columns([("age", age.to_string())])).unwrap();
        }

        let operand = format!("{low} {high}");
        let mut indexed = db.query().unwrap();
        indexed.add_cond("age", QueryOp::NumBt, &operand).unwrap();
        let mut scanned = db.query().unwrap();
        scanned.add_cond("age", QueryOp::NumBt.no_index(), &operand).unwrap();

        let (min, max) = (low.min(high), low.max(high));
        let mut expected: Vec<Vec<u8>> = ages
            .iter()
            .enumerate()
            .filter(|(_, age)| (min..=max).contains(*age))
            .map(|(i, _)| i.to_string().into_bytes())
            .collect();
        expected.sort();

        let mut got = indexed.search().unwrap();
        got.sort();
        prop_assert_eq!(&got, &expected);
        let mut got = scanned.search().unwrap();
        got.sort();
        prop_assert_eq!(&got, &expected);
    }
}
