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

use std::env;
use std::path::PathBuf;
use std::sync::Once;

use dml_lib::api;
use serde_json::json;
use testutils::TestEnv;

static PATH_INIT: Once = Once::new();

/// Puts the directory holding the file protocol handler binary on PATH
/// so `find_handler` can locate it by its conventional name. Every test
/// in this binary calls this first, so the one mutation happens before
/// any concurrent environment reads.
fn with_handler_on_path() {
    PATH_INIT.call_once(|| {
        let handler = PathBuf::from(env!("CARGO_BIN_EXE_dml-remote-file-handler"));
        let mut paths = vec![handler.parent().unwrap().to_path_buf()];
        paths.extend(env::split_paths(&env::var_os("PATH").unwrap_or_default()));
        unsafe {
            env::set_var("PATH", env::join_paths(paths).unwrap());
        }
    });
}

fn names(dags: &serde_json::Value) -> Vec<String> {
    dags.as_array()
        .unwrap()
        .iter()
        .map(|dag| dag["name"].as_str().unwrap().to_owned())
        .collect()
}

fn commit_int_dag(config: &dml_lib::config::Config, name: &str, value: i64) {
    let token = api::begin_dag(config, name, "remote test", None).unwrap();
    let node = api::invoke(config, &token, &json!(["put_literal", [value], {}])).unwrap();
    api::invoke(config, &token, &json!(["commit", [node], {}])).unwrap();
}

// Push to an empty remote, clone it elsewhere, push back, and pull: both
// sides converge on the union of dags.
#[test]
fn test_remote_round_trip() {
    with_handler_on_path();
    let staging = testutils::new_temp_dir();
    let uri = format!("file://{}", staging.path().join("remote").display());

    let env1 = TestEnv::init("r1");
    commit_int_dag(&env1.config, "d0", 23);
    api::create_remote(&env1.config, "origin", &uri).unwrap();
    api::push_remote(&env1.config, "origin").unwrap();

    let mut env2 = TestEnv::init("scratch");
    api::create_remote(&env2.config, "origin", &uri).unwrap();
    api::clone_remote(&env2.config, "origin", "cloned").unwrap();
    env2.config.repo = Some("cloned".to_owned());
    assert_eq!(names(&api::list_dags(&env2.config).unwrap()), ["d0"]);

    commit_int_dag(&env2.config, "d1", 7);
    api::push_remote(&env2.config, "origin").unwrap();

    api::pull_remote(&env1.config, "origin").unwrap();
    assert_eq!(names(&api::list_dags(&env1.config).unwrap()), ["d0", "d1"]);
    // Fetch left the namespaced remote branch behind.
    assert!(api::list_branches(&env1.config)
        .unwrap()
        .contains(&"origin/main".to_owned()));
}

#[test]
fn test_create_remote_requires_a_handler() {
    with_handler_on_path();
    let env = TestEnv::init("r1");
    let err = api::create_remote(&env.config, "nope", "bogus-scheme://x").unwrap_err();
    assert!(err.to_string().contains("dml-remote-bogus-scheme-handler"));
}
