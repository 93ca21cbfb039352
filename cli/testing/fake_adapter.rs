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

//! A fake adapter, useful for testing.
//!
//! Reads the standard request payload from stdin. The resource's kwargs
//! must be a dict holding a `flag` path: while the file is missing the
//! adapter fails with a message on stderr, and once it exists the adapter
//! completes the fndag dump with a literal result of 42.

use std::io::Read as _;
use std::process::exit;

use serde_json::json;

fn kwarg(kwargs: &serde_json::Value, name: &str) -> Option<String> {
    // Kwargs arrive in the tagged map form: ["d", [k, v]...].
    let pairs = kwargs.as_array()?;
    for pair in &pairs[1..] {
        let pair = pair.as_array()?;
        if pair.first()?.as_str()? == name {
            return pair.get(1)?.as_str().map(str::to_owned);
        }
    }
    None
}

fn main() {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input).unwrap();
    let request: serde_json::Value = serde_json::from_str(&input).unwrap();

    let flag = kwarg(&request["kwargs"], "flag").unwrap_or_default();
    if !std::fs::exists(&flag).unwrap_or(false) {
        eprintln!("kaboom: flag file missing: {flag}");
        exit(1);
    }

    let cache_key = request["cache_key"].as_str().unwrap();
    let dump = request["dump"].as_str().unwrap();
    let mut pairs: Vec<serde_json::Value> = serde_json::from_str(dump).unwrap();

    // The dump ends with the unfilled fndag; seal it with a fresh
    // literal node. Minted ids are free-form 32-digit hex, so reusing
    // the cache key in other tables is safe.
    let datum_key = format!("datum/{cache_key}");
    let node_key = format!("node/{cache_key}");
    let fndag = pairs.pop().unwrap();
    let fndag_key = fndag[0].as_str().unwrap().to_owned();
    let mut payload = fndag[1].clone();
    assert_eq!(payload[0].as_str(), Some("FnDag"), "root must be an fndag");
    payload[1]
        .as_array_mut()
        .unwrap()
        .push(json!(node_key.clone()));
    payload[3] = json!(node_key.clone());

    pairs.push(json!([datum_key, ["Datum", 42]]));
    pairs.push(json!([node_key, ["Node", ["Literal", datum_key], null]]));
    pairs.push(json!([fndag_key, payload]));
    println!("{}", serde_json::Value::Array(pairs));
}
