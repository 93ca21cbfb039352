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

use assert_matches::assert_matches;
use dml_lib::model::Datum;
use dml_lib::model::Node;
use dml_lib::model::NodeData;
use dml_lib::model::Object;
use dml_lib::model::Value;
use dml_lib::object_id::ObjectKind;
use dml_lib::object_id::Ref;
use dml_lib::store::StoreError;
use testutils::TestRepo;

#[test]
fn test_content_addressed_put_is_idempotent() {
    let test = TestRepo::init();
    test.repo
        .write(|tx| {
            let datum = Object::Datum(Datum::Str("stable".to_owned()));
            let r1 = tx.put(&datum)?;
            let r2 = tx.put(&datum)?;
            assert_eq!(r1, r2);
            assert_eq!(tx.cursor(ObjectKind::Datum)?, vec![r1]);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_minted_put_yields_distinct_refs() {
    let test = TestRepo::init();
    test.repo
        .write(|tx| {
            let datum = tx.put(&Object::Datum(Datum::Int(1)))?;
            let node = Object::Node(Node::new(NodeData::Literal { value: datum }));
            let r1 = tx.put(&node)?;
            let r2 = tx.put(&node)?;
            assert_ne!(r1, r2);
            assert_eq!(tx.cursor(ObjectKind::Node)?.len(), 2);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_immutable_overwrite_is_fatal() {
    let test = TestRepo::init();
    test.repo
        .write(|tx| {
            let r = tx.put(&Object::Datum(Datum::Int(1)))?;
            // Plant different bytes at the same key, then try the honest
            // put again.
            tx.put_at(&r, &Object::Datum(Datum::Int(2)))?;
            assert_matches!(
                tx.put(&Object::Datum(Datum::Int(1))),
                Err(StoreError::ImmutableOverwrite(key)) if key == r.key()
            );
            let existing = tx.put_with(&Object::Datum(Datum::Int(1)), true)?;
            assert_eq!(existing, r);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_walk_reaches_the_closure() {
    let test = TestRepo::init();
    let (dag, node) = test.commit_literal("d0", &Value::Int(23));
    test.repo
        .read(|tx| {
            let reachable = tx.walk(&[Ref::default_head()])?;
            assert!(reachable.contains(&dag));
            assert!(reachable.contains(&node));
            let NodeData::Literal { value } = tx.get_node(&node)?.data else {
                panic!("expected literal");
            };
            assert!(reachable.contains(&value));
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_walk_ordered_puts_dependencies_first() {
    let test = TestRepo::init();
    let (dag, node) = test.commit_literal("d0", &Value::Int(23));
    test.repo
        .read(|tx| {
            let ordered = tx.walk_ordered(std::slice::from_ref(&dag))?;
            assert_eq!(ordered.last(), Some(&dag));
            let pos =
                |r: &Ref| ordered.iter().position(|x| x == r).expect("ref in order");
            let NodeData::Literal { value } = tx.get_node(&node)?.data else {
                panic!("expected literal");
            };
            assert!(pos(&value) < pos(&node));
            assert!(pos(&node) < pos(&dag));
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_abandoned_transaction_discards_writes() {
    let test = TestRepo::init();
    let result: Result<(), _> = test.repo.write(|tx| {
        tx.put(&Object::Datum(Datum::Str("doomed".to_owned())))?;
        Err(dml_lib::repo::RepoError::NoRepo)
    });
    assert!(result.is_err());
    test.repo
        .read(|tx| {
            assert!(tx.cursor(ObjectKind::Datum)?.is_empty());
            Ok(())
        })
        .unwrap();
}
