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
use std::path::PathBuf;

use assert_matches::assert_matches;
use dml_lib::dag_builder;
use dml_lib::dag_builder::NodeValue;
use dml_lib::dispatch;
use dml_lib::dispatch::StartFnOpts;
use dml_lib::model::NodeData;
use dml_lib::model::Resource;
use dml_lib::model::Value;
use dml_lib::object_id::ObjectKind;
use dml_lib::object_id::Ref;
use testutils::TestRepo;

fn cache(test: &TestRepo) -> PathBuf {
    test.repo.cache_path().to_path_buf()
}

/// Runs `daggerml:<op>` over literal args in a fresh dag named `name`,
/// returning the resulting node.
fn apply_builtin(test: &TestRepo, name: &str, op: &str, args: &[Value]) -> Ref {
    let repo = &test.repo;
    let cache = cache(test);
    repo.write(|tx| {
        let index = dag_builder::begin(tx, repo.user(), repo.head(), name, "fn dag", None)?;
        let fn_value = Value::Resource(Resource::new(format!("daggerml:{op}")));
        let mut argv = vec![dispatch::put_literal(tx, &index, &fn_value, None, None, &cache)?];
        for arg in args {
            argv.push(dispatch::put_literal(tx, &index, arg, None, None, &cache)?);
        }
        let node = dispatch::start_fn(tx, &index, &argv, StartFnOpts::new(&cache))?;
        dag_builder::commit(tx, repo.user(), repo.head(), Ok(node.clone()), &index)?;
        Ok(node)
    })
    .unwrap()
}

fn value_of(test: &TestRepo, node: &Ref) -> NodeValue {
    test.repo
        .read(|tx| dag_builder::resolve_node(tx, node))
        .unwrap()
}

fn fndag_count(test: &TestRepo) -> usize {
    test.repo
        .read(|tx| Ok(tx.cursor(ObjectKind::FnDag)?.len()))
        .unwrap()
}

// Apply the same argv on two branches: one fndag, one value.
#[test]
fn test_fn_deduplication() {
    let mut test = TestRepo::init();
    let ints = Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    let n0 = apply_builtin(&test, "d0", "len", std::slice::from_ref(&ints));
    assert_eq!(value_of(&test, &n0), NodeValue::Value(Value::Int(3)));
    assert_eq!(fndag_count(&test), 1);

    test.repo.create_branch("b0", None).unwrap();
    test.repo.checkout("b0").unwrap();
    let n1 = apply_builtin(&test, "e0", "len", std::slice::from_ref(&ints));
    assert_eq!(value_of(&test, &n1), NodeValue::Value(Value::Int(3)));
    // Same argv, same fndag: the application was deduplicated.
    assert_eq!(fndag_count(&test), 1);

    let dag_of = |node: &Ref| {
        test.repo
            .read(|tx| match tx.get_node(node)?.data {
                NodeData::Fn { dag, .. } => Ok(dag),
                _ => panic!("expected fn node"),
            })
            .unwrap()
    };
    assert_eq!(dag_of(&n0), dag_of(&n1));
}

#[test]
fn test_builtin_results() {
    let test = TestRepo::init();
    let map = Value::Map(BTreeMap::from([("a".to_owned(), Value::Int(1))]));

    let node = apply_builtin(&test, "d0", "type", &[map.clone()]);
    assert_eq!(
        value_of(&test, &node),
        NodeValue::Value(Value::Str("dict".to_owned()))
    );

    let node = apply_builtin(&test, "d1", "keys", &[map.clone()]);
    assert_eq!(
        value_of(&test, &node),
        NodeValue::Value(Value::List(vec![Value::Str("a".to_owned())]))
    );

    let node = apply_builtin(
        &test,
        "d2",
        "assoc",
        &[map, Value::Str("b".to_owned()), Value::Int(2)],
    );
    assert_matches!(
        value_of(&test, &node),
        NodeValue::Value(Value::Map(entries)) if entries.len() == 2
    );
}

// Failed built-ins record an error on the fndag instead of raising.
#[test]
fn test_builtin_failure_is_recorded() {
    let test = TestRepo::init();
    let map = Value::Map(BTreeMap::from([("a".to_owned(), Value::Int(1))]));
    let repo = &test.repo;
    let cache = cache(&test);
    let node = repo
        .write(|tx| {
            let index = dag_builder::begin(tx, repo.user(), repo.head(), "d0", "m", None)?;
            let get = Value::Resource(Resource::new("daggerml:get"));
            let argv = vec![
                dispatch::put_literal(tx, &index, &get, None, None, &cache)?,
                dispatch::put_literal(tx, &index, &map, None, None, &cache)?,
                dispatch::put_literal(tx, &index, &Value::Str("b".to_owned()), None, None, &cache)?,
            ];
            dispatch::start_fn(tx, &index, &argv, StartFnOpts::new(&cache))
        })
        .unwrap();
    assert_matches!(
        value_of(&test, &node),
        NodeValue::Error(err) if err.code.as_deref() == Some("key")
    );
}

// A literal holding node refs is ferried through daggerml:build so the
// embedded nodes become recorded dependencies.
#[test]
fn test_put_literal_with_embedded_nodes() {
    let test = TestRepo::init();
    let repo = &test.repo;
    let cache = cache(&test);
    repo.write(|tx| {
        let index = dag_builder::begin(tx, repo.user(), repo.head(), "d0", "m", None)?;
        let datum = dag_builder::put_datum(tx, &Value::Int(23))?;
        let n0 = dag_builder::put_literal_datum(tx, &index, datum, None, None)?;
        let template = Value::List(vec![Value::Node(n0.clone()), Value::Int(2)]);
        let built = dispatch::put_literal(tx, &index, &template, Some("out"), None, &cache)?;
        assert_matches!(
            dag_builder::resolve_node(tx, &built)?,
            NodeValue::Value(Value::List(items))
                if items == vec![Value::Int(23), Value::Int(2)]
        );
        // The ferry consummated a fn application over the template.
        assert_matches!(tx.get_node(&built)?.data, NodeData::Fn { .. });
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_put_literal_of_plain_node_is_identity() {
    let test = TestRepo::init();
    let repo = &test.repo;
    let cache = cache(&test);
    repo.write(|tx| {
        let index = dag_builder::begin(tx, repo.user(), repo.head(), "d0", "m", None)?;
        let datum = dag_builder::put_datum(tx, &Value::Int(1))?;
        let n0 = dag_builder::put_literal_datum(tx, &index, datum, None, None)?;
        let same =
            dispatch::put_literal(tx, &index, &Value::Node(n0.clone()), None, None, &cache)?;
        assert_eq!(same, n0);
        Ok(())
    })
    .unwrap();
}
