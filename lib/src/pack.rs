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

//! Deterministic binary codec.
//!
//! Structurally equal values pack to identical byte strings: map entries
//! are emitted in key order and set elements in the order of their packed
//! bytes, so the serialization carries a total order. Object payloads are
//! tagged with a statically registered type code. Content ids are the
//! 128-bit MD5 of the packed form; this is a local content-addressed
//! store, not a security boundary.

use md5::Digest as _;
use md5::Md5;
use thiserror::Error;

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
use crate::object_id::Id;
use crate::object_id::ID_LENGTH;
use crate::object_id::ObjectKind;
use crate::object_id::Ref;

/// Codec-level failure. Unknown tags on unpack are invariant violations
/// and abort the enclosing transaction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PackError {
    #[error("unknown type tag on unpack: {0:#04x}")]
    UnknownTag(u8),
    #[error("truncated pack data")]
    UnexpectedEof,
    #[error("invalid UTF-8 in packed string")]
    InvalidUtf8,
    #[error("invalid packed ref")]
    InvalidRef,
}

pub type PackResult<T> = Result<T, PackError>;

// Scalar and container tags.
const TAG_NIL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_STR: u8 = 0x05;
const TAG_LIST: u8 = 0x06;
const TAG_SET: u8 = 0x07;
const TAG_MAP: u8 = 0x08;
const TAG_REF: u8 = 0x09;

// Registered type codes. Populated statically; there is no runtime
// registry to mutate.
const TYPE_DATUM: u8 = 0x10;
const TYPE_RESOURCE: u8 = 0x11;
const TYPE_ERROR: u8 = 0x12;
const TYPE_NODE: u8 = 0x13;
const TYPE_DAG: u8 = 0x14;
const TYPE_TREE: u8 = 0x15;
const TYPE_COMMIT: u8 = 0x16;
const TYPE_HEAD: u8 = 0x17;
const TYPE_INDEX: u8 = 0x18;

// Node data discriminators within a TYPE_NODE payload.
const NODE_LITERAL: u8 = 0;
const NODE_IMPORT: u8 = 1;
const NODE_FN: u8 = 2;
const NODE_ARGV: u8 = 3;

/// MD5 of packed bytes; the digest is exactly [`ID_LENGTH`] bytes.
pub fn content_id(bytes: &[u8]) -> Id {
    let digest: [u8; ID_LENGTH] = Md5::digest(bytes).into();
    Id::from_bytes(digest)
}

/// The content id of an object whose identity is its packed form, or
/// `None` for kinds that mint ids instead. Fndags are also `None` here:
/// their id derives from the argv datum alone, via [`fndag_id`].
pub fn object_content_id(obj: &Object) -> Option<Id> {
    match obj {
        Object::Datum(_) | Object::Tree(_) | Object::Commit(_) => {
            Some(content_id(&pack_object(obj)))
        }
        Object::Node(_) | Object::Dag(_) | Object::Head(_) | Object::Index(_) => None,
    }
}

/// The global cache key: an fndag's id is the hash of its argv datum ref
/// and nothing else, so the same argv yields the same fndag in every
/// repository.
pub fn fndag_id(argv_datum: &Ref) -> Id {
    let mut buf = Vec::new();
    write_ref(&mut buf, argv_datum);
    content_id(&buf)
}

pub fn pack_object(obj: &Object) -> Vec<u8> {
    let mut buf = Vec::new();
    match obj {
        Object::Datum(datum) => {
            buf.push(TYPE_DATUM);
            write_datum(&mut buf, datum);
        }
        Object::Node(node) => {
            buf.push(TYPE_NODE);
            write_node(&mut buf, node);
        }
        Object::Dag(dag) => {
            buf.push(TYPE_DAG);
            write_dag(&mut buf, dag);
        }
        Object::Tree(tree) => {
            buf.push(TYPE_TREE);
            write_ref_map(&mut buf, &tree.dags);
        }
        Object::Commit(commit) => {
            buf.push(TYPE_COMMIT);
            write_refs(&mut buf, &commit.parents);
            write_ref(&mut buf, &commit.tree);
            write_str(&mut buf, &commit.author);
            write_str(&mut buf, &commit.committer);
            write_str(&mut buf, &commit.message);
            write_str(&mut buf, &commit.created);
            write_str(&mut buf, &commit.modified);
        }
        Object::Head(head) => {
            buf.push(TYPE_HEAD);
            write_ref(&mut buf, &head.commit);
        }
        Object::Index(index) => {
            buf.push(TYPE_INDEX);
            write_ref(&mut buf, &index.commit);
            write_ref(&mut buf, &index.dag);
        }
    }
    buf
}

pub fn unpack_object(bytes: &[u8]) -> PackResult<Object> {
    let mut reader = Reader::new(bytes);
    let obj = match reader.u8()? {
        TYPE_DATUM => Object::Datum(read_datum(&mut reader)?),
        TYPE_NODE => Object::Node(read_node(&mut reader)?),
        TYPE_DAG => Object::Dag(read_dag(&mut reader)?),
        TYPE_TREE => Object::Tree(Tree {
            dags: read_ref_map(&mut reader)?,
        }),
        TYPE_COMMIT => Object::Commit(Commit {
            parents: read_refs(&mut reader)?,
            tree: read_ref(&mut reader)?,
            author: read_str(&mut reader)?,
            committer: read_str(&mut reader)?,
            message: read_str(&mut reader)?,
            created: read_str(&mut reader)?,
            modified: read_str(&mut reader)?,
        }),
        TYPE_HEAD => Object::Head(Head {
            commit: read_ref(&mut reader)?,
        }),
        TYPE_INDEX => Object::Index(Index {
            commit: read_ref(&mut reader)?,
            dag: read_ref(&mut reader)?,
        }),
        tag => return Err(PackError::UnknownTag(tag)),
    };
    reader.finish()?;
    Ok(obj)
}

fn write_datum(buf: &mut Vec<u8>, datum: &Datum) {
    match datum {
        Datum::Null => buf.push(TAG_NIL),
        Datum::Bool(false) => buf.push(TAG_FALSE),
        Datum::Bool(true) => buf.push(TAG_TRUE),
        Datum::Int(value) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&value.to_be_bytes());
        }
        Datum::Float(value) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&value.to_bits().to_be_bytes());
        }
        Datum::Str(value) => {
            buf.push(TAG_STR);
            write_str_raw(buf, value);
        }
        Datum::Resource(resource) => write_resource(buf, resource),
        Datum::List(refs) => {
            buf.push(TAG_LIST);
            write_len(buf, refs.len());
            for r in refs {
                write_ref(buf, r);
            }
        }
        Datum::Set(refs) => {
            // Elements sort by their packed bytes, which is the total
            // order the serialization guarantees.
            buf.push(TAG_SET);
            write_len(buf, refs.len());
            let mut packed: Vec<Vec<u8>> = refs
                .iter()
                .map(|r| {
                    let mut item = Vec::new();
                    write_ref(&mut item, r);
                    item
                })
                .collect();
            packed.sort();
            for item in packed {
                buf.extend_from_slice(&item);
            }
        }
        Datum::Map(map) => {
            buf.push(TAG_MAP);
            write_len(buf, map.len());
            for (key, value) in map {
                write_str_raw(buf, key);
                write_ref(buf, value);
            }
        }
    }
}

fn read_datum(reader: &mut Reader<'_>) -> PackResult<Datum> {
    Ok(match reader.u8()? {
        TAG_NIL => Datum::Null,
        TAG_FALSE => Datum::Bool(false),
        TAG_TRUE => Datum::Bool(true),
        TAG_INT => Datum::Int(i64::from_be_bytes(reader.array()?)),
        TAG_FLOAT => Datum::Float(f64::from_bits(u64::from_be_bytes(reader.array()?))),
        TAG_STR => Datum::Str(reader.str()?),
        TYPE_RESOURCE => Datum::Resource(read_resource(reader)?),
        TAG_LIST => {
            let len = reader.len()?;
            let mut refs = Vec::with_capacity(len);
            for _ in 0..len {
                refs.push(read_ref(reader)?);
            }
            Datum::List(refs)
        }
        TAG_SET => {
            let len = reader.len()?;
            let mut refs = std::collections::BTreeSet::new();
            for _ in 0..len {
                refs.insert(read_ref(reader)?);
            }
            Datum::Set(refs)
        }
        TAG_MAP => {
            let len = reader.len()?;
            let mut map = std::collections::BTreeMap::new();
            for _ in 0..len {
                let key = reader.str()?;
                map.insert(key, read_ref(reader)?);
            }
            Datum::Map(map)
        }
        tag => return Err(PackError::UnknownTag(tag)),
    })
}

fn write_resource(buf: &mut Vec<u8>, resource: &Resource) {
    buf.push(TYPE_RESOURCE);
    write_str_raw(buf, &resource.uri);
    write_opt_ref(buf, resource.data.as_ref());
    write_opt_str(buf, resource.adapter.as_deref());
}

fn read_resource(reader: &mut Reader<'_>) -> PackResult<Resource> {
    Ok(Resource {
        uri: reader.str()?,
        data: read_opt_ref(reader)?,
        adapter: read_opt_str(reader)?,
    })
}

fn write_error(buf: &mut Vec<u8>, error: &ErrorValue) {
    buf.push(TYPE_ERROR);
    write_str_raw(buf, &error.message);
    write_len(buf, error.context.len());
    for (key, value) in &error.context {
        write_str_raw(buf, key);
        write_str_raw(buf, value);
    }
    write_opt_str(buf, error.code.as_deref());
}

fn read_error(reader: &mut Reader<'_>) -> PackResult<ErrorValue> {
    let message = reader.str()?;
    let len = reader.len()?;
    let mut context = std::collections::BTreeMap::new();
    for _ in 0..len {
        let key = reader.str()?;
        context.insert(key, reader.str()?);
    }
    Ok(ErrorValue {
        message,
        context,
        code: read_opt_str(reader)?,
    })
}

fn write_node(buf: &mut Vec<u8>, node: &Node) {
    match &node.data {
        NodeData::Literal { value } => {
            buf.push(NODE_LITERAL);
            write_ref(buf, value);
        }
        NodeData::Import { dag, node } => {
            buf.push(NODE_IMPORT);
            write_ref(buf, dag);
            write_opt_ref(buf, node.as_ref());
        }
        NodeData::Fn { dag, argv, node } => {
            buf.push(NODE_FN);
            write_ref(buf, dag);
            write_refs(buf, argv);
            write_opt_ref(buf, node.as_ref());
        }
        NodeData::Argv { value } => {
            buf.push(NODE_ARGV);
            write_ref(buf, value);
        }
    }
    write_opt_str(buf, node.doc.as_deref());
}

fn read_node(reader: &mut Reader<'_>) -> PackResult<Node> {
    let data = match reader.u8()? {
        NODE_LITERAL => NodeData::Literal {
            value: read_ref(reader)?,
        },
        NODE_IMPORT => NodeData::Import {
            dag: read_ref(reader)?,
            node: read_opt_ref(reader)?,
        },
        NODE_FN => NodeData::Fn {
            dag: read_ref(reader)?,
            argv: read_refs(reader)?,
            node: read_opt_ref(reader)?,
        },
        NODE_ARGV => NodeData::Argv {
            value: read_ref(reader)?,
        },
        tag => return Err(PackError::UnknownTag(tag)),
    };
    Ok(Node {
        data,
        doc: read_opt_str(reader)?,
    })
}

fn write_dag(buf: &mut Vec<u8>, dag: &Dag) {
    write_refs(buf, &dag.nodes);
    write_ref_map(buf, &dag.names);
    write_opt_ref(buf, dag.result.as_ref());
    match &dag.error {
        None => buf.push(TAG_NIL),
        Some(error) => write_error(buf, error),
    }
    write_opt_ref(buf, dag.argv.as_ref());
}

fn read_dag(reader: &mut Reader<'_>) -> PackResult<Dag> {
    let nodes = read_refs(reader)?;
    let names = read_ref_map(reader)?;
    let result = read_opt_ref(reader)?;
    let error = match reader.u8()? {
        TAG_NIL => None,
        TYPE_ERROR => Some(read_error(reader)?),
        tag => return Err(PackError::UnknownTag(tag)),
    };
    Ok(Dag {
        nodes,
        names,
        result,
        error,
        argv: read_opt_ref(reader)?,
    })
}

fn write_len(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&u32::try_from(len).unwrap().to_be_bytes());
}

fn write_str_raw(buf: &mut Vec<u8>, value: &str) {
    write_len(buf, value.len());
    buf.extend_from_slice(value.as_bytes());
}

fn write_str(buf: &mut Vec<u8>, value: &str) {
    buf.push(TAG_STR);
    write_str_raw(buf, value);
}

fn write_opt_str(buf: &mut Vec<u8>, value: Option<&str>) {
    match value {
        None => buf.push(TAG_NIL),
        Some(value) => write_str(buf, value),
    }
}

fn write_ref(buf: &mut Vec<u8>, r: &Ref) {
    buf.push(TAG_REF);
    buf.push(kind_code(r.kind()));
    write_str_raw(buf, r.id());
}

fn write_opt_ref(buf: &mut Vec<u8>, r: Option<&Ref>) {
    match r {
        None => buf.push(TAG_NIL),
        Some(r) => write_ref(buf, r),
    }
}

fn write_refs(buf: &mut Vec<u8>, refs: &[Ref]) {
    buf.push(TAG_LIST);
    write_len(buf, refs.len());
    for r in refs {
        write_ref(buf, r);
    }
}

fn write_ref_map(buf: &mut Vec<u8>, map: &std::collections::BTreeMap<String, Ref>) {
    buf.push(TAG_MAP);
    write_len(buf, map.len());
    for (key, value) in map {
        write_str_raw(buf, key);
        write_ref(buf, value);
    }
}

fn kind_code(kind: ObjectKind) -> u8 {
    match kind {
        ObjectKind::Index => 0,
        ObjectKind::Head => 1,
        ObjectKind::Commit => 2,
        ObjectKind::Tree => 3,
        ObjectKind::Dag => 4,
        ObjectKind::FnDag => 5,
        ObjectKind::Node => 6,
        ObjectKind::Datum => 7,
    }
}

fn kind_from_code(code: u8) -> PackResult<ObjectKind> {
    Ok(match code {
        0 => ObjectKind::Index,
        1 => ObjectKind::Head,
        2 => ObjectKind::Commit,
        3 => ObjectKind::Tree,
        4 => ObjectKind::Dag,
        5 => ObjectKind::FnDag,
        6 => ObjectKind::Node,
        7 => ObjectKind::Datum,
        _ => return Err(PackError::InvalidRef),
    })
}

fn read_ref(reader: &mut Reader<'_>) -> PackResult<Ref> {
    match reader.u8()? {
        TAG_REF => {}
        tag => return Err(PackError::UnknownTag(tag)),
    }
    read_ref_body(reader)
}

fn read_ref_body(reader: &mut Reader<'_>) -> PackResult<Ref> {
    let kind = kind_from_code(reader.u8()?)?;
    let id = reader.str()?;
    format!("{}/{id}", kind.name())
        .parse()
        .map_err(|_| PackError::InvalidRef)
}

fn read_opt_ref(reader: &mut Reader<'_>) -> PackResult<Option<Ref>> {
    match reader.u8()? {
        TAG_NIL => Ok(None),
        TAG_REF => Ok(Some(read_ref_body(reader)?)),
        tag => Err(PackError::UnknownTag(tag)),
    }
}

fn read_str(reader: &mut Reader<'_>) -> PackResult<String> {
    match reader.u8()? {
        TAG_STR => reader.str(),
        tag => Err(PackError::UnknownTag(tag)),
    }
}

fn read_opt_str(reader: &mut Reader<'_>) -> PackResult<Option<String>> {
    match reader.u8()? {
        TAG_NIL => Ok(None),
        TAG_STR => Ok(Some(reader.str()?)),
        tag => Err(PackError::UnknownTag(tag)),
    }
}

fn read_refs(reader: &mut Reader<'_>) -> PackResult<Vec<Ref>> {
    match reader.u8()? {
        TAG_LIST => {}
        tag => return Err(PackError::UnknownTag(tag)),
    }
    let len = reader.len()?;
    let mut refs = Vec::with_capacity(len);
    for _ in 0..len {
        refs.push(read_ref(reader)?);
    }
    Ok(refs)
}

fn read_ref_map(reader: &mut Reader<'_>) -> PackResult<std::collections::BTreeMap<String, Ref>> {
    match reader.u8()? {
        TAG_MAP => {}
        tag => return Err(PackError::UnknownTag(tag)),
    }
    let len = reader.len()?;
    let mut map = std::collections::BTreeMap::new();
    for _ in 0..len {
        let key = reader.str()?;
        map.insert(key, read_ref(reader)?);
    }
    Ok(map)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn u8(&mut self) -> PackResult<u8> {
        let byte = *self.bytes.get(self.pos).ok_or(PackError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    fn array<const N: usize>(&mut self) -> PackResult<[u8; N]> {
        let end = self.pos.checked_add(N).ok_or(PackError::UnexpectedEof)?;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(PackError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice.try_into().unwrap())
    }

    fn len(&mut self) -> PackResult<usize> {
        Ok(u32::from_be_bytes(self.array()?) as usize)
    }

    fn str(&mut self) -> PackResult<String> {
        let len = self.len()?;
        let end = self.pos.checked_add(len).ok_or(PackError::UnexpectedEof)?;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(PackError::UnexpectedEof)?;
        self.pos = end;
        String::from_utf8(slice.to_vec()).map_err(|_| PackError::InvalidUtf8)
    }

    fn finish(&self) -> PackResult<()> {
        if self.pos == self.bytes.len() {
            Ok(())
        } else {
            Err(PackError::UnknownTag(self.bytes[self.pos]))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::collections::BTreeSet;

    use super::*;
    use crate::object_id::Id;

    fn datum_ref(hex: &'static str) -> Ref {
        Ref::new(ObjectKind::Datum, Id::from_hex(hex))
    }

    #[test]
    fn test_scalar_round_trip() {
        for datum in [
            Datum::Null,
            Datum::Bool(true),
            Datum::Bool(false),
            Datum::Int(-42),
            Datum::Float(1.5),
            Datum::Str("hello".to_owned()),
            Datum::Resource(Resource::with_adapter("s3://bucket/key", "dml-s3-adapter")),
        ] {
            let packed = pack_object(&Object::Datum(datum.clone()));
            assert_eq!(unpack_object(&packed).unwrap(), Object::Datum(datum));
        }
    }

    #[test]
    fn test_container_round_trip() {
        let a = datum_ref("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let b = datum_ref("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
        let datum = Datum::Map(BTreeMap::from([
            ("x".to_owned(), a.clone()),
            ("y".to_owned(), b.clone()),
        ]));
        let packed = pack_object(&Object::Datum(datum.clone()));
        assert_eq!(unpack_object(&packed).unwrap(), Object::Datum(datum));

        let datum = Datum::Set(BTreeSet::from([a, b]));
        let packed = pack_object(&Object::Datum(datum.clone()));
        assert_eq!(unpack_object(&packed).unwrap(), Object::Datum(datum));
    }

    #[test]
    fn test_structural_equality_packs_identically() {
        let a = datum_ref("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let b = datum_ref("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
        // Insertion order must not leak into the packed form.
        let s1 = Datum::Set(BTreeSet::from([a.clone(), b.clone()]));
        let s2 = Datum::Set(BTreeSet::from([b.clone(), a.clone()]));
        assert_eq!(
            pack_object(&Object::Datum(s1)),
            pack_object(&Object::Datum(s2))
        );

        let m1 = Datum::Map(BTreeMap::from([
            ("k1".to_owned(), a.clone()),
            ("k2".to_owned(), b.clone()),
        ]));
        let m2 = Datum::Map(BTreeMap::from([
            ("k2".to_owned(), b),
            ("k1".to_owned(), a),
        ]));
        assert_eq!(
            pack_object(&Object::Datum(m1)),
            pack_object(&Object::Datum(m2))
        );
    }

    #[test]
    fn test_content_id_stability() {
        let datum = Object::Datum(Datum::Str("stable".to_owned()));
        assert_eq!(object_content_id(&datum), object_content_id(&datum));
        let other = Object::Datum(Datum::Str("different".to_owned()));
        assert_ne!(object_content_id(&datum), object_content_id(&other));
    }

    #[test]
    fn test_minted_kinds_have_no_content_id() {
        let node = Object::Node(Node::new(NodeData::Literal {
            value: datum_ref("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
        }));
        assert_eq!(object_content_id(&node), None);
        assert_eq!(object_content_id(&Object::Dag(Dag::default())), None);
    }

    #[test]
    fn test_fndag_id_depends_only_on_argv() {
        let argv = datum_ref("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        assert_eq!(fndag_id(&argv), fndag_id(&argv.clone()));
        let other = datum_ref("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
        assert_ne!(fndag_id(&argv), fndag_id(&other));
    }

    #[test]
    fn test_unknown_tag_is_an_error() {
        assert_eq!(unpack_object(&[0xff]), Err(PackError::UnknownTag(0xff)));
        assert_eq!(unpack_object(&[]), Err(PackError::UnexpectedEof));
    }

    #[test]
    fn test_commit_round_trip() {
        let commit = Commit {
            parents: vec![Ref::new(ObjectKind::Commit, Id::root())],
            tree: Ref::new(ObjectKind::Tree, Id::from_hex("cccccccccccccccccccccccccccccccc")),
            author: "testy@test".to_owned(),
            committer: "testy@test".to_owned(),
            message: "first".to_owned(),
            created: "2024-01-01T00:00:00.000000Z".to_owned(),
            modified: "2024-01-01T00:00:00.000000Z".to_owned(),
        };
        let packed = pack_object(&Object::Commit(commit.clone()));
        assert_eq!(unpack_object(&packed).unwrap(), Object::Commit(commit));
    }
}
