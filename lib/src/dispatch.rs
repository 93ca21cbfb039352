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

//! Function dispatch.
//!
//! Applying an argv `[fn, args...]` materializes the argv as a datum,
//! creates or reuses the fndag keyed on it, and either evaluates a
//! built-in in-process or hands the fndag dump to an adapter subprocess
//! whose response dump is ingested back. Built-in failures and adapter
//! failures are recorded as the fndag's error, not thrown.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::io::Write as _;
use std::path::Path;
use std::process::Command;
use std::process::Stdio;

use serde_json::json;

use crate::dag_builder;
use crate::model::Dag;
use crate::model::Datum;
use crate::model::ErrorValue;
use crate::model::Node;
use crate::model::NodeData;
use crate::model::Object;
use crate::model::Resource;
use crate::model::Value;
use crate::object_id::ObjectKind;
use crate::object_id::Ref;
use crate::pack;
use crate::repo::RepoError;
use crate::repo::RepoResult;
use crate::store::Tx;
use crate::wire;

/// URI scheme of the in-process functions.
pub const BUILTIN_SCHEME: &str = "daggerml";

/// Operations evaluated in-process.
pub const BUILTIN_OPS: [&str; 11] = [
    "type", "len", "keys", "get", "contains", "list", "dict", "set", "assoc", "conj", "build",
];

/// Options for [`start_fn`].
#[derive(Debug, Clone)]
pub struct StartFnOpts<'a> {
    pub retry: bool,
    pub name: Option<&'a str>,
    pub doc: Option<&'a str>,
    /// Path of the cache environment advertised to adapters.
    pub cache_path: &'a Path,
}

impl<'a> StartFnOpts<'a> {
    pub fn new(cache_path: &'a Path) -> Self {
        Self {
            retry: false,
            name: None,
            doc: None,
            cache_path,
        }
    }
}

impl Default for StartFnOpts<'_> {
    fn default() -> Self {
        Self::new(Path::new(""))
    }
}

/// Applies an argv of nodes, where the first node's value unrolls to a
/// [`Resource`]. Returns the consummated `Fn` node in the caller's index
/// when the fndag is ready, or the pending argv node otherwise.
pub fn start_fn(
    tx: &mut Tx,
    index_ref: &Ref,
    argv: &[Ref],
    opts: StartFnOpts<'_>,
) -> RepoResult<Ref> {
    if argv.is_empty() {
        return Err(RepoError::Invoke("empty argv".to_owned()));
    }
    // The argv is stored literally: the datum list of every node's value,
    // function included. This is the global cache key.
    let mut value_refs = vec![];
    for node in argv {
        value_refs.push(dag_builder::value_ref_of(tx, node)?);
    }
    let argv_datum = tx.put(&Object::Datum(Datum::List(value_refs.clone())))?;
    let fndag_ref = Ref::new(ObjectKind::FnDag, pack::fndag_id(&argv_datum));

    let fndag = match tx.get(&fndag_ref)? {
        Some(Object::Dag(dag)) if dag.error.is_some() && opts.retry => {
            // The sole sanctioned overwrite: an errored fndag is replaced
            // in place by a fresh unfilled one before re-dispatch. The id
            // depends only on the argv, so it is unchanged.
            new_fndag(tx, &fndag_ref, &argv_datum)?
        }
        Some(Object::Dag(dag)) => dag,
        Some(_) => return Err(RepoError::Wire(format!("not a dag: {}", fndag_ref.key()))),
        None => new_fndag(tx, &fndag_ref, &argv_datum)?,
    };

    if !fndag.ready() {
        let resource = fn_resource(tx, &value_refs[0])?;
        match builtin_op(&resource) {
            Some(op) => {
                evaluate_builtin(tx, &fndag_ref, op, &value_refs)?;
            }
            None => {
                dispatch_adapter(tx, &fndag_ref, &resource, opts.cache_path)?;
            }
        }
    }

    let fndag = tx.get_dag(&fndag_ref)?;
    if fndag.ready() {
        dag_builder::put_node(
            tx,
            index_ref,
            NodeData::Fn {
                dag: fndag_ref,
                argv: argv.to_vec(),
                node: fndag.result,
            },
            opts.name,
            opts.doc,
        )
    } else {
        fndag
            .argv
            .ok_or_else(|| RepoError::Wire(format!("fndag without argv: {}", fndag_ref.key())))
    }
}

/// Stores a literal value as a node. Values carrying embedded node refs
/// are ferried through a `daggerml:build` application so the embedded
/// nodes become recorded dependencies of the result.
pub fn put_literal(
    tx: &mut Tx,
    index_ref: &Ref,
    value: &Value,
    name: Option<&str>,
    doc: Option<&str>,
    cache_path: &Path,
) -> RepoResult<Ref> {
    if let Value::Node(node) = value {
        return match name {
            Some(name) => dag_builder::set_node(tx, index_ref, name, node),
            None => Ok(node.clone()),
        };
    }
    let nodes = dag_builder::extract_nodes(value);
    let datum = dag_builder::put_datum(tx, value)?;
    if nodes.is_empty() {
        return dag_builder::put_literal_datum(tx, index_ref, datum, name, doc);
    }
    let build = tx.put(&Object::Datum(Datum::Resource(Resource::new(
        "daggerml:build",
    ))))?;
    let fn_node =
        dag_builder::put_literal_datum(tx, index_ref, build, Some("daggerml:build"), None)?;
    let template = dag_builder::put_literal_datum(tx, index_ref, datum, None, None)?;
    let mut argv = vec![fn_node, template];
    for node in nodes {
        let existing = tx.get_node(&node)?;
        argv.push(dag_builder::put_node(
            tx,
            index_ref,
            existing.data,
            None,
            existing.doc.as_deref(),
        )?);
    }
    let opts = StartFnOpts {
        name,
        doc,
        ..StartFnOpts::new(cache_path)
    };
    start_fn(tx, index_ref, &argv, opts)
}

fn new_fndag(tx: &mut Tx, fndag_ref: &Ref, argv_datum: &Ref) -> RepoResult<Dag> {
    let argv_node = tx.put(&Object::Node(Node::new(NodeData::Argv {
        value: argv_datum.clone(),
    })))?;
    let dag = Dag {
        nodes: vec![argv_node.clone()],
        argv: Some(argv_node),
        ..Dag::default()
    };
    tx.put_at(fndag_ref, &Object::Dag(dag.clone()))?;
    Ok(dag)
}

fn fn_resource(tx: &Tx, value_ref: &Ref) -> RepoResult<Resource> {
    match tx.get_datum(value_ref)? {
        Datum::Resource(resource) => Ok(resource),
        other => Err(RepoError::Invoke(format!(
            "fn must unroll to a resource, got {other:?}"
        ))),
    }
}

fn builtin_op(resource: &Resource) -> Option<&str> {
    let (scheme, op) = resource.uri.split_once(':')?;
    (scheme == BUILTIN_SCHEME && BUILTIN_OPS.contains(&op)).then_some(op)
}

/// Evaluates a built-in over the unrolled argv values and seals the fndag
/// with a result node or an error.
fn evaluate_builtin(tx: &mut Tx, fndag_ref: &Ref, op: &str, value_refs: &[Ref]) -> RepoResult<()> {
    // `build` ferries its template through unchanged; short-circuit so
    // the result shares the template's datum.
    let outcome = if op == "build" {
        match value_refs.get(1) {
            Some(template) => Ok(template.clone()),
            None => Err(ErrorValue::with_code("build: missing template", "value")),
        }
    } else {
        let mut args = vec![];
        for r in &value_refs[1..] {
            args.push(dag_builder::unroll_datum(tx, r)?);
        }
        match eval_builtin(op, &args) {
            Ok(value) => Ok(dag_builder::put_datum(tx, &value)?),
            Err(err) => Err(err),
        }
    };
    let mut dag = tx.get_dag(fndag_ref)?;
    match outcome {
        Ok(datum) => {
            let node = tx.put(&Object::Node(Node::new(NodeData::Literal {
                value: datum,
            })))?;
            dag.nodes.push(node.clone());
            dag.result = Some(node);
        }
        Err(err) => dag.error = Some(err),
    }
    tx.put_at(fndag_ref, &Object::Dag(dag))?;
    Ok(())
}

/// Spawns the resource's adapter with the request payload on stdin and
/// ingests the dump it prints. Nonzero exit or empty output records the
/// stderr as the fndag's error, coded by the adapter name.
fn dispatch_adapter(
    tx: &mut Tx,
    fndag_ref: &Ref,
    resource: &Resource,
    cache_path: &Path,
) -> RepoResult<()> {
    let Some(adapter) = resource.adapter.as_deref() else {
        let mut dag = tx.get_dag(fndag_ref)?;
        dag.error = Some(ErrorValue::with_code(
            format!("no adapter for resource: {}", resource.uri),
            "adapter",
        ));
        tx.put_at(fndag_ref, &Object::Dag(dag))?;
        return Ok(());
    };
    let kwargs = match &resource.data {
        None => serde_json::Value::Null,
        Some(data) => wire::value_to_json(&dag_builder::unroll_datum(tx, data)?),
    };
    let request = json!({
        "kwargs": kwargs,
        "cache_db": cache_path.to_string_lossy(),
        "cache_key": fndag_ref.id(),
        "dump": wire::dump_ref(tx, fndag_ref)?,
    });

    tracing::debug!(adapter, uri = %resource.uri, "spawning adapter");
    let mut child = Command::new(adapter)
        .arg(&resource.uri)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| RepoError::Adapter {
            adapter: adapter.to_owned(),
            message: format!("could not execute: {err}"),
        })?;
    child
        .stdin
        .take()
        .expect("stdin should be piped")
        .write_all(request.to_string().as_bytes())?;
    let output = child.wait_with_output()?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stdout = stdout.trim();
    if !output.status.success() || stdout.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = match stderr.trim() {
            "" => "adapter produced no output".to_owned(),
            stderr => stderr.to_owned(),
        };
        let mut dag = tx.get_dag(fndag_ref)?;
        dag.error = Some(ErrorValue::with_code(message, adapter));
        tx.put_at(fndag_ref, &Object::Dag(dag))?;
        return Ok(());
    }
    let loaded = wire::load_ref(tx, stdout, true)?;
    if loaded != *fndag_ref {
        return Err(RepoError::Adapter {
            adapter: adapter.to_owned(),
            message: format!("returned {} instead of {}", loaded.key(), fndag_ref.key()),
        });
    }
    Ok(())
}

/// In-process evaluation of a recognized operation over unrolled values.
fn eval_builtin(op: &str, args: &[Value]) -> Result<Value, ErrorValue> {
    match op {
        "type" => {
            let [x] = args else {
                return Err(arity(op, "one argument"));
            };
            Ok(Value::Str(x.type_name().to_owned()))
        }
        "len" => {
            let [x] = args else {
                return Err(arity(op, "one argument"));
            };
            let len = match x {
                Value::Str(s) => s.chars().count(),
                Value::List(items) => items.len(),
                Value::Set(items) => items.len(),
                Value::Map(entries) => entries.len(),
                other => {
                    return Err(ErrorValue::with_code(
                        format!("len: unsized type: {}", other.type_name()),
                        "type",
                    ));
                }
            };
            Ok(Value::Int(len as i64))
        }
        "keys" => {
            let [Value::Map(entries)] = args else {
                return Err(arity(op, "one dict argument"));
            };
            Ok(Value::List(
                entries.keys().map(|k| Value::Str(k.clone())).collect(),
            ))
        }
        "get" => match args {
            [coll, key] => get_item(coll, key, None),
            [coll, key, default] => get_item(coll, key, Some(default)),
            _ => Err(arity(op, "two or three arguments")),
        },
        "contains" => {
            let [coll, key] = args else {
                return Err(arity(op, "two arguments"));
            };
            let found = match coll {
                Value::List(items) => items.contains(key),
                Value::Set(items) => items.contains(key),
                Value::Map(entries) => match key {
                    Value::Str(key) => entries.contains_key(key),
                    _ => false,
                },
                other => {
                    return Err(ErrorValue::with_code(
                        format!("contains: not a collection: {}", other.type_name()),
                        "type",
                    ));
                }
            };
            Ok(Value::Bool(found))
        }
        "list" => Ok(Value::List(args.to_vec())),
        "set" => Ok(Value::Set(args.iter().cloned().collect())),
        "dict" => {
            if args.len() % 2 != 0 {
                return Err(arity(op, "an even number of arguments"));
            }
            let mut entries = BTreeMap::new();
            for pair in args.chunks_exact(2) {
                let Value::Str(key) = &pair[0] else {
                    return Err(ErrorValue::with_code("dict: keys must be strings", "value"));
                };
                entries.insert(key.clone(), pair[1].clone());
            }
            Ok(Value::Map(entries))
        }
        "assoc" => {
            let [Value::Map(entries), Value::Str(key), value] = args else {
                return Err(arity(op, "a dict, a string key, and a value"));
            };
            let mut entries = entries.clone();
            entries.insert(key.clone(), value.clone());
            Ok(Value::Map(entries))
        }
        "conj" => {
            let [coll, x] = args else {
                return Err(arity(op, "two arguments"));
            };
            match coll {
                Value::List(items) => {
                    let mut items = items.clone();
                    items.push(x.clone());
                    Ok(Value::List(items))
                }
                Value::Set(items) => {
                    let mut items: BTreeSet<Value> = items.clone();
                    items.insert(x.clone());
                    Ok(Value::Set(items))
                }
                other => Err(ErrorValue::with_code(
                    format!("conj: not a collection: {}", other.type_name()),
                    "type",
                )),
            }
        }
        // `build` is handled before generic evaluation.
        _ => Err(ErrorValue::with_code(format!("no such op: {op}"), "value")),
    }
}

fn arity(op: &str, expected: &str) -> ErrorValue {
    ErrorValue::with_code(format!("{op}: expected {expected}"), "value")
}

fn get_item(coll: &Value, key: &Value, default: Option<&Value>) -> Result<Value, ErrorValue> {
    let miss = |err: ErrorValue| match default {
        Some(default) => Ok(default.clone()),
        None => Err(err),
    };
    match (coll, key) {
        (Value::List(items), Value::Int(i)) => {
            let idx = normalize_index(*i, items.len());
            match idx.and_then(|idx| items.get(idx)) {
                Some(item) => Ok(item.clone()),
                None => miss(ErrorValue::with_code(
                    format!("index out of range: {i}"),
                    "index",
                )),
            }
        }
        (Value::List(items), Value::List(parts)) => slice_list(items, parts),
        (Value::Map(entries), Value::Str(key)) => match entries.get(key) {
            Some(item) => Ok(item.clone()),
            None => miss(ErrorValue::with_code(format!("no such key: {key}"), "key")),
        },
        (Value::Map(_), _) => miss(ErrorValue::with_code("dict keys must be strings", "key")),
        (other, _) => Err(ErrorValue::with_code(
            format!("get: not indexable: {}", other.type_name()),
            "type",
        )),
    }
}

fn normalize_index(i: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let idx = if i < 0 { i + len } else { i };
    (0..len).contains(&idx).then_some(idx as usize)
}

/// List slicing with the usual negative-index and clamping semantics;
/// slice parts are `[start]`, `[start, stop]`, or `[start, stop, step]`
/// with nulls for omitted bounds.
fn slice_list(items: &[Value], parts: &[Value]) -> Result<Value, ErrorValue> {
    fn bound(part: Option<&Value>) -> Result<Option<i64>, ErrorValue> {
        match part {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Int(i)) => Ok(Some(*i)),
            Some(other) => Err(ErrorValue::with_code(
                format!("slice bounds must be integers, got {}", other.type_name()),
                "value",
            )),
        }
    }
    if parts.is_empty() || parts.len() > 3 {
        return Err(ErrorValue::with_code(
            "slice takes one to three bounds",
            "value",
        ));
    }
    // A single bound means [stop], matching slice(*key) semantics.
    let (start, stop, step) = if parts.len() == 1 {
        (None, bound(parts.first())?, None)
    } else {
        (
            bound(parts.first())?,
            bound(parts.get(1))?,
            bound(parts.get(2))?,
        )
    };
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(ErrorValue::with_code("slice step cannot be zero", "value"));
    }
    let len = items.len() as i64;
    let clamp = |i: i64, lo: i64, hi: i64| i.clamp(lo, hi);
    let adjust = |i: i64| if i < 0 { i + len } else { i };
    let (mut i, stop) = if step > 0 {
        (
            clamp(start.map_or(0, adjust), 0, len),
            clamp(stop.map_or(len, adjust), 0, len),
        )
    } else {
        (
            clamp(start.map_or(len - 1, adjust), -1, len - 1),
            clamp(stop.map_or(-1, |s| adjust(s).max(-1)), -1, len - 1),
        )
    };
    let mut out = vec![];
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        out.push(items[i as usize].clone());
        i += step;
    }
    Ok(Value::List(out))
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn list(items: impl IntoIterator<Item = i64>) -> Value {
        Value::List(items.into_iter().map(Value::Int).collect())
    }

    #[test_case(Value::Null, "NoneType")]
    #[test_case(Value::Bool(true), "bool")]
    #[test_case(Value::Int(1), "int")]
    #[test_case(Value::Float(1.5), "float")]
    #[test_case(Value::Str(String::new()), "str")]
    #[test_case(Value::Resource(Resource::new("s3://x")), "Resource")]
    #[test_case(Value::List(vec![]), "list")]
    #[test_case(Value::Set(BTreeSet::new()), "set")]
    #[test_case(Value::Map(BTreeMap::new()), "dict")]
    fn test_type_builtin(value: Value, expected: &str) {
        assert_eq!(
            eval_builtin("type", &[value]).unwrap(),
            Value::Str(expected.to_owned())
        );
    }

    #[test]
    fn test_len() {
        assert_eq!(eval_builtin("len", &[list([1, 2, 3])]).unwrap(), Value::Int(3));
        assert_eq!(
            eval_builtin("len", &[Value::Str("abc".to_owned())]).unwrap(),
            Value::Int(3)
        );
        assert_eq!(
            eval_builtin("len", &[Value::Int(1)]).unwrap_err().code,
            Some("type".to_owned())
        );
    }

    #[test]
    fn test_get_index_and_key_errors() {
        let coll = list([10, 20, 30]);
        assert_eq!(
            eval_builtin("get", &[coll.clone(), Value::Int(1)]).unwrap(),
            Value::Int(20)
        );
        assert_eq!(
            eval_builtin("get", &[coll.clone(), Value::Int(-1)]).unwrap(),
            Value::Int(30)
        );
        assert_eq!(
            eval_builtin("get", &[coll.clone(), Value::Int(7)])
                .unwrap_err()
                .code,
            Some("index".to_owned())
        );
        assert_eq!(
            eval_builtin("get", &[coll, Value::Int(7), Value::Str("d".to_owned())]).unwrap(),
            Value::Str("d".to_owned())
        );

        let map = Value::Map(BTreeMap::from([("a".to_owned(), Value::Int(1))]));
        assert_eq!(
            eval_builtin("get", &[map.clone(), Value::Str("a".to_owned())]).unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            eval_builtin("get", &[map, Value::Str("b".to_owned())])
                .unwrap_err()
                .code,
            Some("key".to_owned())
        );
    }

    #[test]
    fn test_get_slice() {
        let coll = list([0, 1, 2, 3, 4]);
        let slice = |parts: Vec<Value>| {
            eval_builtin("get", &[coll.clone(), Value::List(parts)]).unwrap()
        };
        assert_eq!(slice(vec![Value::Int(2)]), list([0, 1]));
        assert_eq!(slice(vec![Value::Int(1), Value::Int(3)]), list([1, 2]));
        assert_eq!(
            slice(vec![Value::Null, Value::Null, Value::Int(-1)]),
            list([4, 3, 2, 1, 0])
        );
        assert_eq!(slice(vec![Value::Int(-2), Value::Null]), list([3, 4]));
    }

    #[test]
    fn test_constructors() {
        assert_eq!(
            eval_builtin("list", &[Value::Int(1), Value::Int(2)]).unwrap(),
            list([1, 2])
        );
        assert_eq!(
            eval_builtin("set", &[Value::Int(2), Value::Int(1), Value::Int(2)]).unwrap(),
            Value::Set(BTreeSet::from([Value::Int(1), Value::Int(2)]))
        );
        assert_eq!(
            eval_builtin(
                "dict",
                &[Value::Str("k".to_owned()), Value::Int(1)]
            )
            .unwrap(),
            Value::Map(BTreeMap::from([("k".to_owned(), Value::Int(1))]))
        );
        assert_eq!(
            eval_builtin("dict", &[Value::Int(1)]).unwrap_err().code,
            Some("value".to_owned())
        );
    }

    #[test]
    fn test_assoc_conj_contains_keys() {
        let map = Value::Map(BTreeMap::from([("a".to_owned(), Value::Int(1))]));
        assert_eq!(
            eval_builtin(
                "assoc",
                &[map.clone(), Value::Str("b".to_owned()), Value::Int(2)]
            )
            .unwrap(),
            Value::Map(BTreeMap::from([
                ("a".to_owned(), Value::Int(1)),
                ("b".to_owned(), Value::Int(2)),
            ]))
        );
        assert_eq!(
            eval_builtin("conj", &[list([1]), Value::Int(2)]).unwrap(),
            list([1, 2])
        );
        assert_eq!(
            eval_builtin("contains", &[map.clone(), Value::Str("a".to_owned())]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval_builtin("keys", &[map]).unwrap(),
            Value::List(vec![Value::Str("a".to_owned())])
        );
    }
}
