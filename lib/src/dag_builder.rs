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

//! The dag construction protocol.
//!
//! A client begins an index against a branch, issues builder operations
//! that each rewrite the index's staged commit, and finally commits,
//! which merges the staged commit into the branch tip and deletes the
//! index.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use itertools::Itertools as _;

use crate::merge;
use crate::model::Commit;
use crate::model::Dag;
use crate::model::Datum;
use crate::model::ErrorValue;
use crate::model::Head;
use crate::model::Index;
use crate::model::Node;
use crate::model::NodeData;
use crate::model::Object;
use crate::model::Value;
use crate::model::timestamp_now;
use crate::object_id::Ref;
use crate::repo::Ctx;
use crate::repo::RepoError;
use crate::repo::RepoResult;
use crate::store::Tx;

/// What a node resolves to: a datum, a recorded failure, or nothing yet.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    Value(Value),
    Error(ErrorValue),
    Pending,
}

/// Creates (or adopts) a dag under `name` and stages a commit for it,
/// returning the ref of the freshly allocated index.
pub fn begin(
    tx: &mut Tx,
    user: &str,
    head: &Ref,
    name: &str,
    message: &str,
    dag: Option<Ref>,
) -> RepoResult<Ref> {
    let ctx = Ctx::from_head(tx, head)?;
    let dag_ref = match dag {
        Some(r) => {
            tx.get_dag(&r)?;
            r
        }
        None => tx.put(&Object::Dag(Dag::default()))?,
    };
    let mut tree = ctx.tree;
    tree.dags.insert(name.to_owned(), dag_ref.clone());
    let tree = tx.put(&Object::Tree(tree))?;
    let commit = Commit::new(vec![ctx.commit_ref], tree, user, message);
    let commit = tx.put(&Object::Commit(commit))?;
    let index = tx.put(&Object::Index(Index {
        commit,
        dag: dag_ref,
    }))?;
    Ok(index)
}

/// Stores a value as a datum graph by recursive descent: containers
/// become refs-of-refs, scalars and resources become leaves. Node refs
/// embedded in the value are replaced by the node's resolved datum.
pub fn put_datum(tx: &mut Tx, value: &Value) -> RepoResult<Ref> {
    let datum = match value {
        Value::Null => Datum::Null,
        Value::Bool(b) => Datum::Bool(*b),
        Value::Int(i) => Datum::Int(*i),
        Value::Float(f) => Datum::Float(*f),
        Value::Str(s) => Datum::Str(s.clone()),
        Value::Resource(resource) => Datum::Resource(resource.clone()),
        Value::List(items) => {
            let refs = items
                .iter()
                .map(|item| put_datum(tx, item))
                .try_collect()?;
            Datum::List(refs)
        }
        Value::Set(items) => {
            let mut refs = BTreeSet::new();
            for item in items {
                refs.insert(put_datum(tx, item)?);
            }
            Datum::Set(refs)
        }
        Value::Map(entries) => {
            let mut map = BTreeMap::new();
            for (key, item) in entries {
                map.insert(key.clone(), put_datum(tx, item)?);
            }
            Datum::Map(map)
        }
        Value::Node(node_ref) => {
            return match resolve_ref(tx, node_ref)? {
                Some(Ok(datum)) => Ok(datum),
                Some(Err(err)) => Err(RepoError::Invoke(format!(
                    "node {} holds an error: {err}",
                    node_ref.key()
                ))),
                None => Err(RepoError::Invoke(format!(
                    "node {} has no value yet",
                    node_ref.key()
                ))),
            };
        }
    };
    Ok(tx.put(&Object::Datum(datum))?)
}

/// Mints a node and appends it to the index's dag, optionally naming it.
/// Rewrites the staged tree and commit and persists the index at its id.
pub fn put_node(
    tx: &mut Tx,
    index_ref: &Ref,
    data: NodeData,
    name: Option<&str>,
    doc: Option<&str>,
) -> RepoResult<Ref> {
    let node = tx.put(&Object::Node(Node {
        data,
        doc: doc.map(str::to_owned),
    }))?;
    with_index_dag(tx, index_ref, |dag| {
        if !dag.nodes.contains(&node) {
            dag.nodes.push(node.clone());
        }
        if let Some(name) = name {
            dag.names.insert(name.to_owned(), node.clone());
        }
        Ok(())
    })?;
    Ok(node)
}

/// Records a name for an existing node of the index's dag.
pub fn set_node(tx: &mut Tx, index_ref: &Ref, name: &str, node: &Ref) -> RepoResult<Ref> {
    tx.get_node(node)?;
    with_index_dag(tx, index_ref, |dag| {
        if !dag.nodes.contains(node) {
            dag.nodes.push(node.clone());
        }
        dag.names.insert(name.to_owned(), node.clone());
        Ok(())
    })?;
    Ok(node.clone())
}

/// Sugar: a literal node over an already-stored datum.
pub fn put_literal_datum(
    tx: &mut Tx,
    index_ref: &Ref,
    value: Ref,
    name: Option<&str>,
    doc: Option<&str>,
) -> RepoResult<Ref> {
    put_node(tx, index_ref, NodeData::Literal { value }, name, doc)
}

/// Sugar: an import node borrowing from another dag.
pub fn put_load(
    tx: &mut Tx,
    index_ref: &Ref,
    dag: Ref,
    node: Option<Ref>,
    name: Option<&str>,
    doc: Option<&str>,
) -> RepoResult<Ref> {
    tx.get_dag(&dag)?;
    put_node(tx, index_ref, NodeData::Import { dag, node }, name, doc)
}

/// Seals the index's dag with a result node or an error, merges the
/// staged commit into the branch tip, moves the head, and deletes the
/// index. Returns the committed dag's ref.
pub fn commit(
    tx: &mut Tx,
    user: &str,
    head: &Ref,
    res_or_err: Result<Ref, ErrorValue>,
    index_ref: &Ref,
) -> RepoResult<Ref> {
    let index = tx
        .get_index(index_ref)?
        .ok_or_else(|| RepoError::NoSuchIndex(index_ref.key()))?;
    let mut dag = tx.get_dag(&index.dag)?;
    if dag.ready() {
        return Err(RepoError::DagCommitted);
    }
    match res_or_err {
        Ok(node) => {
            tx.get_node(&node)?;
            dag.result = Some(node);
        }
        Err(err) => dag.error = Some(err),
    }
    tx.put_at(&index.dag, &Object::Dag(dag))?;

    let mut commit = tx.get_commit(&index.commit)?;
    commit.modified = timestamp_now();
    let staged = tx.put(&Object::Commit(commit))?;

    let tip = Ctx::from_head(tx, head)?.commit_ref;
    let merged = merge::merge(tx, user, &tip, &staged)?;
    tx.put_at(head, &Object::Head(Head { commit: merged }))?;
    tx.delete(index_ref)?;
    Ok(index.dag)
}

/// Looks a dag up by name in the branch tip's tree.
pub fn get_dag(tx: &Tx, head: &Ref, name: &str) -> RepoResult<Option<Ref>> {
    Ok(Ctx::from_head(tx, head)?.tree.dags.get(name).cloned())
}

/// The names table of the index's dag (or an explicit dag).
pub fn get_names(tx: &Tx, dag_ref: &Ref) -> RepoResult<BTreeMap<String, Ref>> {
    Ok(tx.get_dag(dag_ref)?.names)
}

/// The argv node of an fndag, absent for ordinary dags.
pub fn get_argv(tx: &Tx, dag_ref: &Ref) -> RepoResult<Option<Ref>> {
    Ok(tx.get_dag(dag_ref)?.argv)
}

/// The result node of a dag, or its recorded error.
pub fn get_result(tx: &Tx, dag_ref: &Ref) -> RepoResult<Result<Option<Ref>, ErrorValue>> {
    let dag = tx.get_dag(dag_ref)?;
    match dag.error {
        Some(err) => Ok(Err(err)),
        None => Ok(Ok(dag.result)),
    }
}

/// Resolves a node to its datum ref, following imports and function
/// results.
pub(crate) fn value_ref_of(tx: &Tx, node_ref: &Ref) -> RepoResult<Ref> {
    match resolve_ref(tx, node_ref)? {
        Some(Ok(r)) => Ok(r),
        _ => Err(RepoError::Invoke(format!(
            "node {} has no value",
            node_ref.key()
        ))),
    }
}

fn resolve_ref(tx: &Tx, node_ref: &Ref) -> RepoResult<Option<Result<Ref, ErrorValue>>> {
    let node = tx.get_node(node_ref)?;
    match node.data {
        NodeData::Literal { value } | NodeData::Argv { value } => Ok(Some(Ok(value))),
        NodeData::Import { dag, node } | NodeData::Fn { dag, node, .. } => match node {
            Some(inner) => resolve_ref(tx, &inner),
            None => {
                let dag = tx.get_dag(&dag)?;
                if let Some(err) = dag.error {
                    return Ok(Some(Err(err)));
                }
                match dag.result {
                    Some(result) => resolve_ref(tx, &result),
                    None => Ok(None),
                }
            }
        },
    }
}

/// Resolves a node all the way to an unrolled value, error, or pending
/// state.
pub fn resolve_node(tx: &Tx, node_ref: &Ref) -> RepoResult<NodeValue> {
    match resolve_ref(tx, node_ref)? {
        None => Ok(NodeValue::Pending),
        Some(Err(err)) => Ok(NodeValue::Error(err)),
        Some(Ok(datum)) => Ok(NodeValue::Value(unroll_datum(tx, &datum)?)),
    }
}

/// Unrolls a datum graph back into an embedded value.
pub fn unroll_datum(tx: &Tx, datum_ref: &Ref) -> RepoResult<Value> {
    let value = match tx.get_datum(datum_ref)? {
        Datum::Null => Value::Null,
        Datum::Bool(b) => Value::Bool(b),
        Datum::Int(i) => Value::Int(i),
        Datum::Float(f) => Value::Float(f),
        Datum::Str(s) => Value::Str(s),
        Datum::Resource(resource) => Value::Resource(resource),
        Datum::List(refs) => Value::List(
            refs.iter()
                .map(|r| unroll_datum(tx, r))
                .try_collect()?,
        ),
        Datum::Set(refs) => {
            let mut items = BTreeSet::new();
            for r in &refs {
                items.insert(unroll_datum(tx, r)?);
            }
            Value::Set(items)
        }
        Datum::Map(map) => {
            let mut entries = BTreeMap::new();
            for (key, r) in &map {
                entries.insert(key.clone(), unroll_datum(tx, r)?);
            }
            Value::Map(entries)
        }
    };
    Ok(value)
}

/// Node refs embedded in a builder input value, in first-appearance
/// order. These become argv dependencies when the value is ferried
/// through a `daggerml:build` application.
pub fn extract_nodes(value: &Value) -> Vec<Ref> {
    fn walk(value: &Value, out: &mut Vec<Ref>) {
        match value {
            Value::Node(r) => {
                if !out.contains(r) {
                    out.push(r.clone());
                }
            }
            Value::List(items) => {
                for item in items {
                    walk(item, out);
                }
            }
            Value::Set(items) => {
                for item in items {
                    walk(item, out);
                }
            }
            Value::Map(entries) => {
                for item in entries.values() {
                    walk(item, out);
                }
            }
            _ => {}
        }
    }
    let mut out = vec![];
    walk(value, &mut out);
    out
}

/// Applies a dag mutation through an index, then rewrites the staged
/// tree, commit, and index. Fails if the dag is already committed.
fn with_index_dag(
    tx: &mut Tx,
    index_ref: &Ref,
    f: impl FnOnce(&mut Dag) -> RepoResult<()>,
) -> RepoResult<()> {
    let index = tx
        .get_index(index_ref)?
        .ok_or_else(|| RepoError::NoSuchIndex(index_ref.key()))?;
    let mut dag = tx.get_dag(&index.dag)?;
    if dag.ready() {
        return Err(RepoError::DagCommitted);
    }
    f(&mut dag)?;
    tx.put_at(&index.dag, &Object::Dag(dag))?;

    let mut commit = tx.get_commit(&index.commit)?;
    let tree = tx.get_tree(&commit.tree)?;
    // The dag keeps its minted id, so the tree itself is unchanged; the
    // commit advances its modified stamp and the index follows it.
    let tree = tx.put(&Object::Tree(tree))?;
    commit.tree = tree;
    commit.modified = timestamp_now();
    let commit = tx.put(&Object::Commit(commit))?;
    tx.put_at(index_ref, &Object::Index(Index {
        commit,
        dag: index.dag,
    }))?;
    Ok(())
}
