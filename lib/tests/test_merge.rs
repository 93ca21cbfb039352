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
use dml_lib::merge;
use dml_lib::model::Value;
use dml_lib::object_id::Ref;
use dml_lib::repo::Ctx;
use dml_lib::repo::RepoError;
use testutils::TEST_USER;
use testutils::TestRepo;

fn tip(test: &TestRepo) -> Ref {
    test.repo
        .read(|tx| Ok(Ctx::from_head(tx, test.repo.head())?.commit_ref))
        .unwrap()
}

fn tree_names(test: &TestRepo, commit: &Ref) -> Vec<String> {
    test.repo
        .read(|tx| {
            let tree = tx.get_commit(commit)?.tree;
            Ok(tx.get_tree(&tree)?.dags.keys().cloned().collect())
        })
        .unwrap()
}

/// Sets up the classic fork: d0 on main, then `b` adds d1 while main
/// adds d2. Returns (fork, main tip, b tip).
fn diverge(test: &mut TestRepo) -> (Ref, Ref, Ref) {
    test.commit_literal("d0", &Value::Int(0));
    let fork = tip(test);
    test.repo.create_branch("b", None).unwrap();
    test.commit_literal("d2", &Value::Int(2));
    let main_tip = tip(test);
    test.repo.checkout("b").unwrap();
    test.commit_literal("d1", &Value::Int(1));
    let b_tip = tip(test);
    test.repo.checkout("main").unwrap();
    (fork, main_tip, b_tip)
}

#[test]
fn test_merge_base_is_the_fork() {
    let mut test = TestRepo::init();
    let (fork, main_tip, b_tip) = diverge(&mut test);
    test.repo
        .read(|tx| {
            let base = merge::merge_base(tx, &main_tip, &b_tip)?;
            assert_eq!(base, fork);
            // The base is an ancestor of both tips.
            assert!(merge::topo_sort(tx, &[main_tip.clone()])?.contains(&base));
            assert!(merge::topo_sort(tx, &[b_tip.clone()])?.contains(&base));
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_three_way_merge() {
    let mut test = TestRepo::init();
    let (_fork, main_tip, b_tip) = diverge(&mut test);
    let merged = test
        .repo
        .write(|tx| merge::merge(tx, TEST_USER, &main_tip, &b_tip))
        .unwrap();
    assert_eq!(tree_names(&test, &merged), ["d0", "d1", "d2"]);
    test.repo
        .read(|tx| {
            let commit = tx.get_commit(&merged)?;
            assert_eq!(commit.parents, vec![main_tip.clone(), b_tip.clone()]);
            Ok(())
        })
        .unwrap();

    // Symmetric in the resulting tree.
    let flipped = test
        .repo
        .write(|tx| merge::merge(tx, TEST_USER, &b_tip, &main_tip))
        .unwrap();
    assert_eq!(tree_names(&test, &flipped), ["d0", "d1", "d2"]);
}

#[test]
fn test_merge_degenerates_to_fast_forward() {
    let mut test = TestRepo::init();
    let (fork, main_tip, _b_tip) = diverge(&mut test);
    test.repo
        .write(|tx| {
            assert_eq!(merge::merge(tx, TEST_USER, &main_tip, &main_tip)?, main_tip);
            // One side contains the other: no merge commit.
            assert_eq!(merge::merge(tx, TEST_USER, &fork, &main_tip)?, main_tip);
            assert_eq!(merge::merge(tx, TEST_USER, &main_tip, &fork)?, main_tip);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_merge_branch_moves_the_head() {
    let mut test = TestRepo::init();
    diverge(&mut test);
    let merged = test.repo.merge_branch("b").unwrap();
    assert_eq!(tip(&test), merged);
    let dags = test.repo.dags().unwrap();
    assert!(dags.contains_key("d1") && dags.contains_key("d2"));
}

#[test]
fn test_rebase_replays_onto_the_target() {
    let mut test = TestRepo::init();
    let (_fork, main_tip, b_tip) = diverge(&mut test);
    let rebased = test
        .repo
        .write(|tx| merge::rebase(tx, TEST_USER, &main_tip, &b_tip))
        .unwrap();
    assert_eq!(tree_names(&test, &rebased), ["d0", "d1", "d2"]);
    test.repo
        .read(|tx| {
            let commit = tx.get_commit(&rebased)?;
            // Linear history: the replayed commit sits on the target tip.
            assert_eq!(commit.parents, vec![main_tip.clone()]);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_rebase_of_contained_history_is_a_no_op() {
    let mut test = TestRepo::init();
    let (fork, main_tip, _) = diverge(&mut test);
    test.repo
        .write(|tx| {
            assert_eq!(merge::rebase(tx, TEST_USER, &fork, &main_tip)?, main_tip);
            assert_eq!(merge::rebase(tx, TEST_USER, &main_tip, &fork)?, main_tip);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_squash_collapses_a_range() {
    let test = TestRepo::init();
    test.commit_literal("d0", &Value::Int(0));
    let base = tip(&test);
    test.commit_literal("d1", &Value::Int(1));
    test.commit_literal("d2", &Value::Int(2));
    let end = tip(&test);

    let squashed = test
        .repo
        .write(|tx| merge::squash(tx, TEST_USER, &base, &end))
        .unwrap();
    assert_eq!(tree_names(&test, &squashed), ["d0", "d1", "d2"]);
    test.repo
        .read(|tx| {
            let commit = tx.get_commit(&squashed)?;
            assert_eq!(commit.parents, vec![base.clone()]);
            Ok(())
        })
        .unwrap();
    // The head was reparented onto the squashed commit.
    assert_eq!(tip(&test), squashed);
}

#[test]
fn test_squash_requires_ancestry() {
    let mut test = TestRepo::init();
    let (_fork, main_tip, b_tip) = diverge(&mut test);
    let err = test
        .repo
        .write(|tx| merge::squash(tx, TEST_USER, &main_tip, &b_tip))
        .unwrap_err();
    assert_matches!(err, RepoError::NotAnAncestor { .. });
}

#[test]
fn test_topo_sort_child_before_parent() {
    let test = TestRepo::init();
    test.commit_literal("d0", &Value::Int(0));
    let first = tip(&test);
    test.commit_literal("d1", &Value::Int(1));
    let second = tip(&test);
    test.repo
        .read(|tx| {
            let sorted = merge::topo_sort(tx, &[second.clone()])?;
            let pos = |r: &Ref| sorted.iter().position(|x| x == r).unwrap();
            assert!(pos(&second) < pos(&first));
            Ok(())
        })
        .unwrap();
}
