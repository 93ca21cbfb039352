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

//! Test helpers: throwaway repositories and configs in temp directories.

use std::path::Path;

use dml_lib::config::Config;
use dml_lib::dag_builder;
use dml_lib::model::Value;
use dml_lib::object_id::Ref;
use dml_lib::repo::Repo;
use tempfile::TempDir;

pub const TEST_USER: &str = "testy@test";

pub fn new_temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("dml-test-")
        .tempdir()
        .unwrap()
}

/// A repository in a temp directory that lives as long as this value.
pub struct TestRepo {
    _temp_dir: TempDir,
    pub repo: Repo,
}

impl TestRepo {
    pub fn init() -> Self {
        let temp_dir = new_temp_dir();
        let repo = Repo::create(&temp_dir.path().join("repo"), TEST_USER).unwrap();
        Self {
            _temp_dir: temp_dir,
            repo,
        }
    }

    pub fn path(&self) -> &Path {
        self.repo.path()
    }

    /// Builds and commits a single-literal dag on the current branch,
    /// returning (dag ref, result node ref).
    pub fn commit_literal(&self, name: &str, value: &Value) -> (Ref, Ref) {
        let repo = &self.repo;
        repo.write(|tx| {
            let index = dag_builder::begin(tx, repo.user(), repo.head(), name, "test dag", None)?;
            let datum = dag_builder::put_datum(tx, value)?;
            let node = dag_builder::put_literal_datum(tx, &index, datum, None, None)?;
            let dag = dag_builder::commit(tx, repo.user(), repo.head(), Ok(node.clone()), &index)?;
            Ok((dag, node))
        })
        .unwrap()
    }
}

/// A config (and its backing directories) with one repository created
/// and selected, for exercising the api layer end to end.
pub struct TestEnv {
    _temp_dir: TempDir,
    pub config: Config,
}

impl TestEnv {
    pub fn init(repo_name: &str) -> Self {
        let temp_dir = new_temp_dir();
        let mut config = Config::new(
            temp_dir.path().join("dml"),
            temp_dir.path().join("project"),
        );
        config.user = TEST_USER.to_owned();
        Repo::create(&config.repo_dir().join(repo_name), TEST_USER).unwrap();
        config.repo = Some(repo_name.to_owned());
        Self {
            _temp_dir: temp_dir,
            config,
        }
    }
}
