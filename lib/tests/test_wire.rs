// Copyright 2024 The DaggerML Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use assert_matches::assert_matches;
use dml_lib::dag_builder;
use dml_lib::dag_builder::NodeValue;
use dml_lib::model::Datum;
use dml_lib::model::Value;
use dml_lib::repo::RepoError;
use dml_lib::store::StoreError;
use dml_lib::wire;
use pretty_assertions::assert_eq;
use serde_json::json;
use testutils::TestRepo;

fn sample_value() -> Value {
    Value::Map(BTreeMap::from([
        ("n".to_owned(), Value::Int(23)),
        (
            "s".to_owned(),
            Value::Set(BTreeSet::from([Value::Int(4), Value::Int(6)])),
        ),
    ]))
}

// Dump a committed dag and load it into a fresh repository: the root ref
// survives verbatim and the closure matches id for id.
#[test]
fn test_dump_load_identity() {
    let source = TestRepo::init();
    let (dag, node) = source.commit_literal("d0", &sample_value());
    let dump = source
        .repo
        .read(|tx| wire::dump_ref(tx, &dag))
        .unwrap();

    let target = TestRepo::init();
    let loaded = target
        .repo
        .write(|tx| wire::load_ref(tx, &dump, false))
        .unwrap();
    assert_eq!(loaded, dag);

    let source_ids = source
        .repo
        .read(|tx| Ok(tx.walk(std::slice::from_ref(&dag))?))
        .unwrap();
    let target_ids = target
        .repo
        .read(|tx| Ok(tx.walk(std::slice::from_ref(&dag))?))
        .unwrap();
    assert_eq!(source_ids, target_ids);

    // The loaded node reads back the same value.
    target
        .repo
        .read(|tx| {
            assert_matches!(
                dag_builder::resolve_node(tx, &node)?,
                NodeValue::Value(value) if value == sample_value()
            );
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_load_is_idempotent() {
    let source = TestRepo::init();
    let (dag, _) = source.commit_literal("d0", &Value::Int(23));
    let dump = source.repo.read(|tx| wire::dump_ref(tx, &dag)).unwrap();
    let target = TestRepo::init();
    for _ in 0..2 {
        let loaded = target
            .repo
            .write(|tx| wire::load_ref(tx, &dump, false))
            .unwrap();
        assert_eq!(loaded, dag);
    }
}

#[test]
fn test_load_rejects_conflicting_payloads() {
    let test = TestRepo::init();
    let datum_ref = test
        .repo
        .write(|tx| dag_builder::put_datum(tx, &Value::Int(23)))
        .unwrap();
    let conflicting =
        serde_json::to_string(&json!([[datum_ref.key(), ["Datum", 999]]])).unwrap();
    let err = test
        .repo
        .write(|tx| wire::load_ref(tx, &conflicting, false))
        .unwrap_err();
    assert_matches!(err, RepoError::Store(StoreError::ImmutableOverwrite(_)));

    // With the escape hatch the existing object wins.
    let loaded = test
        .repo
        .write(|tx| wire::load_ref(tx, &conflicting, true))
        .unwrap();
    assert_eq!(loaded, datum_ref);
    test.repo
        .read(|tx| {
            assert_eq!(tx.get_datum(&datum_ref)?, Datum::Int(23));
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_dump_ends_with_the_root() {
    let test = TestRepo::init();
    let (dag, _) = test.commit_literal("d0", &Value::Int(23));
    let dump = test.repo.read(|tx| wire::dump_ref(tx, &dag)).unwrap();
    let pairs: Vec<serde_json::Value> = serde_json::from_str(&dump).unwrap();
    assert!(pairs.len() > 1);
    assert_eq!(pairs.last().unwrap()[0].as_str(), Some(dag.key().as_str()));
}
