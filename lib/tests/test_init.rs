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
use dml_lib::kv::KvError;
use dml_lib::model::Value;
use dml_lib::object_id::Ref;
use dml_lib::repo::Repo;
use dml_lib::repo::RepoError;
use testutils::TEST_USER;
use testutils::TestRepo;

#[test]
fn test_init_creates_default_branch() {
    let test = TestRepo::init();
    assert_eq!(test.repo.branches().unwrap(), ["main"]);
    test.repo
        .read(|tx| {
            assert!(tx.meta_get("/init")?.is_some());
            let head = tx.get_head(&Ref::default_head())?.unwrap();
            // The root commit lives at the universal constant id so that
            // unrelated repositories share a common ancestor.
            assert_eq!(head.commit.id(), "00000000000000000000000000000000");
            let root = tx.get_commit(&head.commit)?;
            assert!(root.parents.is_empty());
            assert!(tx.get_tree(&root.tree)?.dags.is_empty());
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_create_twice_fails() {
    let test = TestRepo::init();
    assert_matches!(
        Repo::create(test.path(), TEST_USER),
        Err(RepoError::Kv(KvError::Exists(_)))
    );
}

#[test]
fn test_open_existing() {
    let test = TestRepo::init();
    let reopened = Repo::open(test.path(), TEST_USER, None).unwrap();
    assert_eq!(reopened.branches().unwrap(), ["main"]);

    assert_matches!(
        Repo::open(test.path(), TEST_USER, Some("nope")),
        Err(RepoError::NoSuchBranch(name)) if name == "nope"
    );
}

#[test]
fn test_branch_lifecycle() {
    let mut test = TestRepo::init();
    test.repo.create_branch("b0", None).unwrap();
    assert_eq!(test.repo.branches().unwrap(), ["b0", "main"]);
    assert_matches!(
        test.repo.create_branch("b0", None),
        Err(RepoError::BranchExists(_))
    );

    test.repo.checkout("b0").unwrap();
    assert_matches!(test.repo.delete_branch("b0"), Err(RepoError::CurrentBranch));
    test.repo.checkout("main").unwrap();
    test.repo.delete_branch("b0").unwrap();
    assert_eq!(test.repo.branches().unwrap(), ["main"]);
    assert_matches!(
        test.repo.delete_branch("b0"),
        Err(RepoError::NoSuchBranch(_))
    );
}

#[test]
fn test_create_branch_from_commit() {
    let mut test = TestRepo::init();
    test.commit_literal("d0", &Value::Int(1));
    let tip = test
        .repo
        .log()
        .unwrap()
        .first()
        .map(|(r, _)| r.clone())
        .unwrap();
    test.repo.create_branch("b0", Some(&tip)).unwrap();
    test.repo.checkout("b0").unwrap();
    assert!(test.repo.dags().unwrap().contains_key("d0"));
}

#[test]
fn test_copy_repo() {
    let test = TestRepo::init();
    test.commit_literal("d0", &Value::Int(1));
    let dest = test.path().parent().unwrap().join("copy");
    test.repo.copy(&dest).unwrap();
    let copied = Repo::open(&dest, TEST_USER, None).unwrap();
    assert!(copied.dags().unwrap().contains_key("d0"));
}
