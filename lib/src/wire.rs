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

//! The external wire encoding.
//!
//! Every core value round-trips through a tagged tuple form: scalars are
//! bare JSON scalars, lists are tagged `"l"`, sets `"s"`, maps `"d"`, and
//! typed records carry their type name followed by the ordered field
//! list. Inside object payloads refs encode as their `"kind/id"` strings;
//! inside user values an embedded ref is tagged `["Ref", ...]`.
//!
//! A dump is a JSON array of `[ref, payload]` pairs in topological order
//! ending with the root, so a loader can write each pair at its given id
//! before anything downstream dereferences it.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use itertools::Itertools as _;
use serde_json::json;

use crate::model::Commit;
use crate::model::Dag;
use crate::model::Datum;
use crate::model::ErrorValue;
use crate::model::Head;
use crate::model::Index;
use crate::model::Node;
use crate::model::NodeData;
use crate::model::Object;
use crate::model::Resource;
use crate::model::Tree;
use crate::model::Value;
use crate::object_id::ObjectKind;
use crate::object_id::Ref;
use crate::pack;
use crate::repo::RepoError;
use crate::repo::RepoResult;
use crate::store::StoreError;
use crate::store::Tx;

/// Encodes an unrolled user value.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => json!(f),
        Value::Str(s) => json!(s),
        Value::Resource(resource) => resource_to_json(resource),
        Value::List(items) => tagged("l", items.iter().map(value_to_json)),
        Value::Set(items) => tagged("s", items.iter().map(value_to_json)),
        Value::Map(entries) => map_to_json(entries.iter().map(|(k, v)| (k, value_to_json(v)))),
        Value::Node(r) => json!(["Ref", r.key()]),
    }
}

/// Decodes an unrolled user value.
pub fn value_from_json(value: &serde_json::Value) -> RepoResult<Value> {
    match value {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(Value::Int(i)),
            None => n
                .as_f64()
                .map(Value::Float)
                .ok_or_else(|| wire_err(value, "number")),
        },
        serde_json::Value::String(s) => Ok(Value::Str(s.clone())),
        serde_json::Value::Array(items) => {
            let tag = items
                .first()
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| wire_err(value, "tagged array"))?;
            let rest = &items[1..];
            match tag {
                "l" => Ok(Value::List(
                    rest.iter().map(value_from_json).try_collect()?,
                )),
                "s" => {
                    let mut set = BTreeSet::new();
                    for item in rest {
                        set.insert(value_from_json(item)?);
                    }
                    Ok(Value::Set(set))
                }
                "d" => {
                    let mut map = BTreeMap::new();
                    for pair in rest {
                        let (key, item) = decode_pair(pair)?;
                        map.insert(key.to_owned(), value_from_json(item)?);
                    }
                    Ok(Value::Map(map))
                }
                "Resource" => Ok(Value::Resource(resource_from_json(rest)?)),
                "Ref" => {
                    let key = rest
                        .first()
                        .and_then(serde_json::Value::as_str)
                        .ok_or_else(|| wire_err(value, "ref"))?;
                    Ok(Value::Node(key.parse()?))
                }
                _ => Err(wire_err(value, "value tag")),
            }
        }
        serde_json::Value::Object(_) => Err(wire_err(value, "value")),
    }
}

pub fn error_to_json(error: &ErrorValue) -> serde_json::Value {
    json!([
        "Error",
        error.message,
        map_to_json(error.context.iter().map(|(k, v)| (k, json!(v)))),
        error.code,
    ])
}

pub fn error_from_json(value: &serde_json::Value) -> RepoResult<ErrorValue> {
    let items = value
        .as_array()
        .filter(|items| items.first().and_then(|t| t.as_str()) == Some("Error"))
        .ok_or_else(|| wire_err(value, "error"))?;
    let [_, message, context, code] = items.as_slice() else {
        return Err(wire_err(value, "error"));
    };
    let mut ctx = BTreeMap::new();
    if !context.is_null() {
        let pairs = context
            .as_array()
            .filter(|items| items.first().and_then(|t| t.as_str()) == Some("d"))
            .ok_or_else(|| wire_err(context, "error context"))?;
        for pair in &pairs[1..] {
            let (key, item) = decode_pair(pair)?;
            ctx.insert(
                key.to_owned(),
                item.as_str()
                    .ok_or_else(|| wire_err(item, "error context value"))?
                    .to_owned(),
            );
        }
    }
    Ok(ErrorValue {
        message: message
            .as_str()
            .ok_or_else(|| wire_err(message, "error message"))?
            .to_owned(),
        context: ctx,
        code: match code {
            serde_json::Value::Null => None,
            serde_json::Value::String(code) => Some(code.clone()),
            _ => return Err(wire_err(code, "error code")),
        },
    })
}

/// Encodes a stored object as its tagged payload.
pub fn object_to_json(obj: &Object) -> serde_json::Value {
    match obj {
        Object::Datum(datum) => json!(["Datum", datum_to_json(datum)]),
        Object::Node(node) => {
            let data = match &node.data {
                NodeData::Literal { value } => json!(["Literal", value.key()]),
                NodeData::Import { dag, node } => {
                    json!(["Import", dag.key(), opt_ref(node.as_ref())])
                }
                NodeData::Fn { dag, argv, node } => json!([
                    "Fn",
                    dag.key(),
                    tagged("l", argv.iter().map(|r| json!(r.key()))),
                    opt_ref(node.as_ref()),
                ]),
                NodeData::Argv { value } => json!(["Argv", value.key()]),
            };
            json!(["Node", data, node.doc])
        }
        Object::Dag(dag) => {
            let nodes = tagged("l", dag.nodes.iter().map(|r| json!(r.key())));
            let names = map_to_json(dag.names.iter().map(|(k, r)| (k, json!(r.key()))));
            let result = opt_ref(dag.result.as_ref());
            let error = match &dag.error {
                None => serde_json::Value::Null,
                Some(err) => error_to_json(err),
            };
            match &dag.argv {
                None => json!(["Dag", nodes, names, result, error]),
                Some(argv) => json!(["FnDag", nodes, names, result, error, argv.key()]),
            }
        }
        Object::Tree(tree) => json!([
            "Tree",
            map_to_json(tree.dags.iter().map(|(k, r)| (k, json!(r.key())))),
        ]),
        Object::Commit(commit) => json!([
            "Commit",
            tagged("l", commit.parents.iter().map(|r| json!(r.key()))),
            commit.tree.key(),
            commit.author,
            commit.committer,
            commit.message,
            commit.created,
            commit.modified,
        ]),
        Object::Head(head) => json!(["Head", head.commit.key()]),
        Object::Index(index) => json!(["Index", index.commit.key(), index.dag.key()]),
    }
}

/// Decodes a stored object from its tagged payload.
pub fn object_from_json(value: &serde_json::Value) -> RepoResult<Object> {
    let items = value.as_array().ok_or_else(|| wire_err(value, "object"))?;
    let tag = items
        .first()
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| wire_err(value, "object tag"))?;
    let rest = &items[1..];
    match (tag, rest) {
        ("Datum", [payload]) => Ok(Object::Datum(datum_from_json(payload)?)),
        ("Node", [data, doc]) => {
            let fields = data.as_array().ok_or_else(|| wire_err(data, "node data"))?;
            let tag = fields
                .first()
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| wire_err(data, "node tag"))?;
            let data = match (tag, &fields[1..]) {
                ("Literal", [value]) => NodeData::Literal {
                    value: ref_from_json(value)?,
                },
                ("Import", [dag, node]) => NodeData::Import {
                    dag: ref_from_json(dag)?,
                    node: opt_ref_from_json(node)?,
                },
                ("Fn", [dag, argv, node]) => NodeData::Fn {
                    dag: ref_from_json(dag)?,
                    argv: refs_from_json(argv)?,
                    node: opt_ref_from_json(node)?,
                },
                ("Argv", [value]) => NodeData::Argv {
                    value: ref_from_json(value)?,
                },
                _ => return Err(wire_err(data, "node data")),
            };
            Ok(Object::Node(Node {
                data,
                doc: match doc {
                    serde_json::Value::Null => None,
                    serde_json::Value::String(doc) => Some(doc.clone()),
                    _ => return Err(wire_err(doc, "node doc")),
                },
            }))
        }
        ("Dag", [nodes, names, result, error]) => Ok(Object::Dag(dag_from_json(
            nodes, names, result, error, None,
        )?)),
        ("FnDag", [nodes, names, result, error, argv]) => Ok(Object::Dag(dag_from_json(
            nodes,
            names,
            result,
            error,
            Some(ref_from_json(argv)?),
        )?)),
        ("Tree", [dags]) => Ok(Object::Tree(Tree {
            dags: ref_map_from_json(dags)?,
        })),
        ("Commit", [parents, tree, author, committer, message, created, modified]) => {
            Ok(Object::Commit(Commit {
                parents: refs_from_json(parents)?,
                tree: ref_from_json(tree)?,
                author: str_from_json(author)?,
                committer: str_from_json(committer)?,
                message: str_from_json(message)?,
                created: str_from_json(created)?,
                modified: str_from_json(modified)?,
            }))
        }
        ("Head", [commit]) => Ok(Object::Head(Head {
            commit: ref_from_json(commit)?,
        })),
        ("Index", [commit, dag]) => Ok(Object::Index(Index {
            commit: ref_from_json(commit)?,
            dag: ref_from_json(dag)?,
        })),
        _ => Err(wire_err(value, "object")),
    }
}

/// Serializes the transitive closure of `root` as a dump string.
pub fn dump_ref(tx: &Tx, root: &Ref) -> RepoResult<String> {
    let mut pairs = vec![];
    for r in tx.walk_ordered(std::slice::from_ref(root))? {
        let obj = tx.get_existing(&r)?;
        pairs.push(json!([r.key(), object_to_json(&obj)]));
    }
    Ok(serde_json::to_string(&pairs)?)
}

/// Loads a dump, writing every pair at its given id, and returns the
/// root (last) ref. Content-addressed pairs that collide with different
/// existing bytes fail unless `return_existing`; fndags are exempt since
/// their content legitimately evolves in place.
pub fn load_ref(tx: &mut Tx, dump: &str, return_existing: bool) -> RepoResult<Ref> {
    let pairs: Vec<serde_json::Value> = serde_json::from_str(dump)?;
    let mut last = None;
    for pair in &pairs {
        let items = pair.as_array().ok_or_else(|| wire_err(pair, "dump pair"))?;
        let [r, payload] = items.as_slice() else {
            return Err(wire_err(pair, "dump pair"));
        };
        let r: Ref = r
            .as_str()
            .ok_or_else(|| wire_err(r, "dump ref"))?
            .parse()?;
        let obj = object_from_json(payload)?;
        let immutable = matches!(
            r.kind(),
            ObjectKind::Datum | ObjectKind::Tree | ObjectKind::Commit
        );
        if immutable {
            let data = pack::pack_object(&obj);
            match tx.raw(&r)? {
                Some(existing) if existing != data && !return_existing => {
                    return Err(StoreError::ImmutableOverwrite(r.key()).into());
                }
                Some(_) => {
                    last = Some(r);
                    continue;
                }
                None => {}
            }
        }
        tx.put_at(&r, &obj)?;
        last = Some(r);
    }
    last.ok_or_else(|| RepoError::Wire("empty dump".to_owned()))
}

fn datum_to_json(datum: &Datum) -> serde_json::Value {
    match datum {
        Datum::Null => serde_json::Value::Null,
        Datum::Bool(b) => json!(b),
        Datum::Int(i) => json!(i),
        Datum::Float(f) => json!(f),
        Datum::Str(s) => json!(s),
        Datum::Resource(resource) => resource_to_json(resource),
        Datum::List(refs) => tagged("l", refs.iter().map(|r| json!(r.key()))),
        Datum::Set(refs) => tagged("s", refs.iter().map(|r| json!(r.key()))),
        Datum::Map(map) => map_to_json(map.iter().map(|(k, r)| (k, json!(r.key())))),
    }
}

fn datum_from_json(value: &serde_json::Value) -> RepoResult<Datum> {
    match value {
        serde_json::Value::Null => Ok(Datum::Null),
        serde_json::Value::Bool(b) => Ok(Datum::Bool(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(Datum::Int(i)),
            None => n
                .as_f64()
                .map(Datum::Float)
                .ok_or_else(|| wire_err(value, "number")),
        },
        serde_json::Value::String(s) => Ok(Datum::Str(s.clone())),
        serde_json::Value::Array(items) => {
            let tag = items
                .first()
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| wire_err(value, "datum tag"))?;
            let rest = &items[1..];
            match tag {
                "l" => Ok(Datum::List(
                    rest.iter().map(ref_from_json).try_collect()?,
                )),
                "s" => {
                    let mut refs = BTreeSet::new();
                    for item in rest {
                        refs.insert(ref_from_json(item)?);
                    }
                    Ok(Datum::Set(refs))
                }
                "d" => {
                    let mut map = BTreeMap::new();
                    for pair in rest {
                        let (key, item) = decode_pair(pair)?;
                        map.insert(key.to_owned(), ref_from_json(item)?);
                    }
                    Ok(Datum::Map(map))
                }
                "Resource" => Ok(Datum::Resource(resource_from_json(rest)?)),
                _ => Err(wire_err(value, "datum tag")),
            }
        }
        serde_json::Value::Object(_) => Err(wire_err(value, "datum")),
    }
}

fn resource_to_json(resource: &Resource) -> serde_json::Value {
    json!([
        "Resource",
        resource.uri,
        opt_ref(resource.data.as_ref()),
        resource.adapter,
    ])
}

fn resource_from_json(fields: &[serde_json::Value]) -> RepoResult<Resource> {
    let [uri, data, adapter] = fields else {
        return Err(RepoError::Wire("malformed resource".to_owned()));
    };
    Ok(Resource {
        uri: str_from_json(uri)?,
        data: opt_ref_from_json(data)?,
        adapter: match adapter {
            serde_json::Value::Null => None,
            serde_json::Value::String(adapter) => Some(adapter.clone()),
            _ => return Err(wire_err(adapter, "resource adapter")),
        },
    })
}

fn dag_from_json(
    nodes: &serde_json::Value,
    names: &serde_json::Value,
    result: &serde_json::Value,
    error: &serde_json::Value,
    argv: Option<Ref>,
) -> RepoResult<Dag> {
    Ok(Dag {
        nodes: refs_from_json(nodes)?,
        names: ref_map_from_json(names)?,
        result: opt_ref_from_json(result)?,
        error: match error {
            serde_json::Value::Null => None,
            _ => Some(error_from_json(error)?),
        },
        argv,
    })
}

fn tagged(tag: &str, items: impl Iterator<Item = serde_json::Value>) -> serde_json::Value {
    let mut array = vec![json!(tag)];
    array.extend(items);
    serde_json::Value::Array(array)
}

fn map_to_json<'a>(
    entries: impl Iterator<Item = (&'a String, serde_json::Value)>,
) -> serde_json::Value {
    tagged("d", entries.map(|(k, v)| json!([k, v])))
}

fn decode_pair(pair: &serde_json::Value) -> RepoResult<(&str, &serde_json::Value)> {
    let items = pair.as_array().ok_or_else(|| wire_err(pair, "map entry"))?;
    let [key, value] = items.as_slice() else {
        return Err(wire_err(pair, "map entry"));
    };
    Ok((
        key.as_str().ok_or_else(|| wire_err(key, "map key"))?,
        value,
    ))
}

fn opt_ref(r: Option<&Ref>) -> serde_json::Value {
    match r {
        None => serde_json::Value::Null,
        Some(r) => json!(r.key()),
    }
}

fn ref_from_json(value: &serde_json::Value) -> RepoResult<Ref> {
    Ok(value
        .as_str()
        .ok_or_else(|| wire_err(value, "ref"))?
        .parse()?)
}

fn opt_ref_from_json(value: &serde_json::Value) -> RepoResult<Option<Ref>> {
    match value {
        serde_json::Value::Null => Ok(None),
        _ => Ok(Some(ref_from_json(value)?)),
    }
}

fn refs_from_json(value: &serde_json::Value) -> RepoResult<Vec<Ref>> {
    let items = value
        .as_array()
        .filter(|items| items.first().and_then(|t| t.as_str()) == Some("l"))
        .ok_or_else(|| wire_err(value, "ref list"))?;
    items[1..].iter().map(ref_from_json).try_collect()
}

fn ref_map_from_json(value: &serde_json::Value) -> RepoResult<BTreeMap<String, Ref>> {
    let items = value
        .as_array()
        .filter(|items| items.first().and_then(|t| t.as_str()) == Some("d"))
        .ok_or_else(|| wire_err(value, "ref map"))?;
    let mut map = BTreeMap::new();
    for pair in &items[1..] {
        let (key, item) = decode_pair(pair)?;
        map.insert(key.to_owned(), ref_from_json(item)?);
    }
    Ok(map)
}

fn str_from_json(value: &serde_json::Value) -> RepoResult<String> {
    Ok(value
        .as_str()
        .ok_or_else(|| wire_err(value, "string"))?
        .to_owned())
}

fn wire_err(value: &serde_json::Value, expected: &str) -> RepoError {
    RepoError::Wire(format!("expected {expected}, got: {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_id::Id;

    fn datum_ref(hex: &'static str) -> Ref {
        Ref::new(ObjectKind::Datum, Id::from_hex(hex))
    }

    #[test]
    fn test_value_round_trip() {
        let value = Value::Map(BTreeMap::from([
            ("foo".to_owned(), Value::Int(23)),
            (
                "bar".to_owned(),
                Value::Set(BTreeSet::from([Value::Int(4), Value::Int(6)])),
            ),
            (
                "baz".to_owned(),
                Value::List(vec![Value::Bool(true), Value::Float(3.5)]),
            ),
            (
                "res".to_owned(),
                Value::Resource(Resource::with_adapter("s3://x/y", "dml-s3-adapter")),
            ),
        ]));
        let encoded = value_to_json(&value);
        assert_eq!(value_from_json(&encoded).unwrap(), value);
    }

    #[test]
    fn test_error_round_trip() {
        let mut error = ErrorValue::with_code("kaboom", "adapter");
        error.context.insert("stderr".to_owned(), "trace".to_owned());
        let encoded = error_to_json(&error);
        assert_eq!(error_from_json(&encoded).unwrap(), error);
    }

    #[test]
    fn test_object_round_trip() {
        let a = datum_ref("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let root = Ref::new(ObjectKind::Commit, Id::root());
        for obj in [
            Object::Datum(Datum::Map(BTreeMap::from([("k".to_owned(), a.clone())]))),
            Object::Node(Node {
                data: NodeData::Literal { value: a.clone() },
                doc: Some("docs".to_owned()),
            }),
            Object::Tree(Tree::default()),
            Object::Head(Head {
                commit: root.clone(),
            }),
            Object::Commit(Commit {
                parents: vec![root.clone()],
                tree: Ref::new(ObjectKind::Tree, Id::from_hex("cccccccccccccccccccccccccccccccc")),
                author: "testy@test".to_owned(),
                committer: "testy@test".to_owned(),
                message: "m".to_owned(),
                created: "2024-01-01T00:00:00.000000Z".to_owned(),
                modified: "2024-01-01T00:00:00.000000Z".to_owned(),
            }),
            Object::Index(Index {
                commit: root,
                dag: Ref::new(ObjectKind::Dag, Id::from_hex("dddddddddddddddddddddddddddddddd")),
            }),
        ] {
            let encoded = object_to_json(&obj);
            assert_eq!(object_from_json(&encoded).unwrap(), obj);
        }
    }

    #[test]
    fn test_fndag_payload_keeps_argv() {
        let argv = Ref::new(ObjectKind::Node, Id::from_hex("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"));
        let dag = Dag {
            nodes: vec![argv.clone()],
            argv: Some(argv),
            ..Dag::default()
        };
        let encoded = object_to_json(&Object::Dag(dag.clone()));
        assert_eq!(encoded[0], json!("FnDag"));
        assert_eq!(object_from_json(&encoded).unwrap(), Object::Dag(dag));
    }
}
