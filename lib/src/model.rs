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

//! The entity algebra: every value type that can live in the store.
//!
//! Containers inside a [`Datum`] hold refs to other datums rather than
//! embedded values; [`Value`] is the unrolled counterpart used at the API
//! boundary and by the built-in functions.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use chrono::SecondsFormat;
use chrono::Utc;

use crate::object_id::ObjectKind;
use crate::object_id::Ref;

/// Current time as an ISO-8601 UTC string, the format commit timestamps
/// are stored in.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// An opaque handle identified by URI, carried as a scalar datum leaf.
///
/// The URI scheme selects the dispatch path when the resource is applied
/// as a function; `adapter` names the executable that computes it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Resource {
    pub uri: String,
    pub data: Option<Ref>,
    pub adapter: Option<String>,
}

impl Resource {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            data: None,
            adapter: None,
        }
    }

    pub fn with_adapter(uri: impl Into<String>, adapter: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            data: None,
            adapter: Some(adapter.into()),
        }
    }

    /// The URI scheme, used to pick built-in vs adapter dispatch.
    pub fn scheme(&self) -> Option<&str> {
        self.uri.split_once(':').map(|(scheme, _)| scheme)
    }
}

/// A first-class failure record. This is a storable value returned through
/// the result channel, not a Rust error type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ErrorValue {
    pub message: String,
    pub context: BTreeMap<String, String>,
    pub code: Option<String>,
}

impl ErrorValue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: BTreeMap::new(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: BTreeMap::new(),
            code: Some(code.into()),
        }
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({code})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// The stored form of a user value. Leaves carry inline scalars; container
/// elements are refs to other datums, so structurally equal values share
/// storage all the way down.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Resource(Resource),
    List(Vec<Ref>),
    Set(BTreeSet<Ref>),
    Map(BTreeMap<String, Ref>),
}

/// The discriminated payload of a [`Node`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeData {
    /// An inline value.
    Literal { value: Ref },
    /// A value borrowed from another dag: the named node, or the dag's
    /// result when `node` is absent.
    Import { dag: Ref, node: Option<Ref> },
    /// A consummated function application.
    Fn {
        dag: Ref,
        argv: Vec<Ref>,
        node: Option<Ref>,
    },
    /// The reified argument vector inside an fndag.
    Argv { value: Ref },
}

/// A unit of a dag. Nodes have minted identity: two literal nodes with the
/// same value are distinct objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub data: NodeData,
    pub doc: Option<String>,
}

impl Node {
    pub fn new(data: NodeData) -> Self {
        Self { data, doc: None }
    }
}

/// A named acyclic graph of nodes. `argv` is present iff this dag
/// represents a single function application (an fndag), in which case its
/// identity is content-addressed on the argv alone and the dag lives in
/// the fndag sub-table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Dag {
    pub nodes: Vec<Ref>,
    pub names: BTreeMap<String, Ref>,
    pub result: Option<Ref>,
    pub error: Option<ErrorValue>,
    pub argv: Option<Ref>,
}

impl Dag {
    /// A dag is ready once it has resolved to a result or failed.
    pub fn ready(&self) -> bool {
        self.result.is_some() || self.error.is_some()
    }

    /// Reverse lookup of a node's name, if it has one.
    pub fn name_of(&self, node: &Ref) -> Option<&str> {
        self.names
            .iter()
            .find(|(_, r)| *r == node)
            .map(|(name, _)| name.as_str())
    }
}

/// The dag namespace of a commit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tree {
    pub dags: BTreeMap<String, Ref>,
}

/// A point in branch history, content-addressed on its full tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub parents: Vec<Ref>,
    pub tree: Ref,
    pub author: String,
    pub committer: String,
    pub message: String,
    pub created: String,
    pub modified: String,
}

impl Commit {
    pub fn new(parents: Vec<Ref>, tree: Ref, user: &str, message: impl Into<String>) -> Self {
        let now = timestamp_now();
        Self {
            parents,
            tree,
            author: user.to_owned(),
            committer: user.to_owned(),
            message: message.into(),
            created: now.clone(),
            modified: now,
        }
    }
}

/// A named branch pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    pub commit: Ref,
}

/// A movable pointer staging a dag under construction. The commit is
/// rewritten by every builder operation and collapsed into the branch on
/// commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub commit: Ref,
    pub dag: Ref,
}

/// Envelope over every storable value, dispatched on by the store and the
/// codec.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Datum(Datum),
    Node(Node),
    Dag(Dag),
    Tree(Tree),
    Commit(Commit),
    Head(Head),
    Index(Index),
}

impl Object {
    /// The sub-table this object belongs to. A dag carrying an argv is an
    /// fndag.
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Datum(_) => ObjectKind::Datum,
            Self::Node(_) => ObjectKind::Node,
            Self::Dag(dag) if dag.argv.is_some() => ObjectKind::FnDag,
            Self::Dag(_) => ObjectKind::Dag,
            Self::Tree(_) => ObjectKind::Tree,
            Self::Commit(_) => ObjectKind::Commit,
            Self::Head(_) => ObjectKind::Head,
            Self::Index(_) => ObjectKind::Index,
        }
    }

    /// Refs held directly by this object, in field order. This drives the
    /// reachability walk.
    pub fn child_refs(&self) -> Vec<Ref> {
        match self {
            Self::Datum(datum) => match datum {
                Datum::Null
                | Datum::Bool(_)
                | Datum::Int(_)
                | Datum::Float(_)
                | Datum::Str(_) => vec![],
                Datum::Resource(resource) => resource.data.iter().cloned().collect(),
                Datum::List(refs) => refs.clone(),
                Datum::Set(refs) => refs.iter().cloned().collect(),
                Datum::Map(map) => map.values().cloned().collect(),
            },
            Self::Node(node) => match &node.data {
                NodeData::Literal { value } | NodeData::Argv { value } => vec![value.clone()],
                NodeData::Import { dag, node } => {
                    let mut refs = vec![dag.clone()];
                    refs.extend(node.iter().cloned());
                    refs
                }
                NodeData::Fn { dag, argv, node } => {
                    let mut refs = vec![dag.clone()];
                    refs.extend(argv.iter().cloned());
                    refs.extend(node.iter().cloned());
                    refs
                }
            },
            Self::Dag(dag) => {
                let mut refs = dag.nodes.clone();
                refs.extend(dag.names.values().cloned());
                refs.extend(dag.result.iter().cloned());
                refs.extend(dag.argv.iter().cloned());
                refs
            }
            Self::Tree(tree) => tree.dags.values().cloned().collect(),
            Self::Commit(commit) => {
                let mut refs = commit.parents.clone();
                refs.push(commit.tree.clone());
                refs
            }
            Self::Head(head) => vec![head.commit.clone()],
            Self::Index(index) => vec![index.commit.clone(), index.dag.clone()],
        }
    }
}

/// The unrolled form of a datum: containers embed their elements. This is
/// what crosses the API boundary and what the built-in functions compute
/// over. The `Node` variant appears only in builder inputs, marking an
/// embedded dependency on an existing node.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Resource(Resource),
    List(Vec<Value>),
    Set(BTreeSet<Value>),
    Map(BTreeMap<String, Value>),
    Node(Ref),
}

impl Value {
    /// The runtime type name reported by the `type` built-in.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Resource(_) => "Resource",
            Self::List(_) => "list",
            Self::Set(_) => "set",
            Self::Map(_) => "dict",
            Self::Node(_) => "node",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) => 2,
            Self::Float(_) => 3,
            Self::Str(_) => 4,
            Self::Resource(_) => 5,
            Self::List(_) => 6,
            Self::Set(_) => 7,
            Self::Map(_) => 8,
            Self::Node(_) => 9,
        }
    }
}

// Total order so values can live in sets and maps; floats compare by
// total_cmp.
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (Self::Resource(a), Self::Resource(b)) => a.cmp(b),
            (Self::List(a), Self::List(b)) => a.cmp(b),
            (Self::Set(a), Self::Set(b)) => a.iter().cmp(b.iter()),
            (Self::Map(a), Self::Map(b)) => a.iter().cmp(b.iter()),
            (Self::Node(a), Self::Node(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_total_order() {
        let mut set = BTreeSet::new();
        set.insert(Value::Int(2));
        set.insert(Value::Int(1));
        set.insert(Value::Null);
        set.insert(Value::Float(1.5));
        let ranked: Vec<_> = set.into_iter().collect();
        assert_eq!(
            ranked,
            vec![
                Value::Null,
                Value::Int(1),
                Value::Int(2),
                Value::Float(1.5)
            ]
        );
    }

    #[test]
    fn test_value_eq_across_nan() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Int(1), Value::Float(1.0));
    }

    #[test]
    fn test_dag_ready() {
        let mut dag = Dag::default();
        assert!(!dag.ready());
        dag.error = Some(ErrorValue::new("boom"));
        assert!(dag.ready());
    }
}
