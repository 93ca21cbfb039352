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

//! Typed object store layered over the key-value environment.
//!
//! Objects are keyed `"kind/id"`. Content-addressed kinds derive the id
//! from the packed form on `put`; overwriting such a key with different
//! bytes is an invariant violation. Minted kinds get a fresh id on `put`
//! and are rewritten in place with `put_at`.

use std::collections::BTreeSet;
use std::collections::VecDeque;

use thiserror::Error;

use crate::kv;
use crate::kv::KvError;
use crate::kv::Storage;
use crate::kv::Table;
use crate::model::Commit;
use crate::model::Dag;
use crate::model::Datum;
use crate::model::Head;
use crate::model::Index;
use crate::model::Node;
use crate::model::Object;
use crate::model::Tree;
use crate::object_id::Id;
use crate::object_id::ObjectKind;
use crate::object_id::Ref;
use crate::pack;
use crate::pack::PackError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Pack(#[from] PackError),
    #[error("attempt to update immutable object: {0}")]
    ImmutableOverwrite(String),
    #[error("no such object: {0}")]
    NotFound(String),
    #[error("unexpected object kind at {0}")]
    KindMismatch(String),
    #[error("cannot derive an id for {0}; an explicit ref is required")]
    ExplicitRefRequired(&'static str),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A transaction-scoped view of the object store. Every ref dereference
/// threads through an explicit `Tx`; there is no process-global current
/// repository.
pub struct Tx {
    kv: kv::Transaction,
}

impl Tx {
    pub fn begin(storage: &Storage, write: bool) -> StoreResult<Self> {
        Ok(Self {
            kv: storage.begin(write)?,
        })
    }

    pub fn is_write(&self) -> bool {
        self.kv.is_write()
    }

    pub fn commit(self) -> StoreResult<()> {
        Ok(self.kv.commit()?)
    }

    /// Raw stored bytes for a ref, if present.
    pub fn raw(&self, r: &Ref) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.kv.get(Table::Kind(r.kind()), &r.key())?)
    }

    pub fn get(&self, r: &Ref) -> StoreResult<Option<Object>> {
        match self.raw(r)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(pack::unpack_object(&bytes)?)),
        }
    }

    pub fn get_existing(&self, r: &Ref) -> StoreResult<Object> {
        self.get(r)?.ok_or_else(|| StoreError::NotFound(r.key()))
    }

    pub fn get_commit(&self, r: &Ref) -> StoreResult<Commit> {
        match self.get_existing(r)? {
            Object::Commit(commit) => Ok(commit),
            _ => Err(StoreError::KindMismatch(r.key())),
        }
    }

    pub fn get_tree(&self, r: &Ref) -> StoreResult<Tree> {
        match self.get_existing(r)? {
            Object::Tree(tree) => Ok(tree),
            _ => Err(StoreError::KindMismatch(r.key())),
        }
    }

    pub fn get_dag(&self, r: &Ref) -> StoreResult<Dag> {
        match self.get_existing(r)? {
            Object::Dag(dag) => Ok(dag),
            _ => Err(StoreError::KindMismatch(r.key())),
        }
    }

    pub fn get_node(&self, r: &Ref) -> StoreResult<Node> {
        match self.get_existing(r)? {
            Object::Node(node) => Ok(node),
            _ => Err(StoreError::KindMismatch(r.key())),
        }
    }

    pub fn get_datum(&self, r: &Ref) -> StoreResult<Datum> {
        match self.get_existing(r)? {
            Object::Datum(datum) => Ok(datum),
            _ => Err(StoreError::KindMismatch(r.key())),
        }
    }

    pub fn get_head(&self, r: &Ref) -> StoreResult<Option<Head>> {
        match self.get(r)? {
            None => Ok(None),
            Some(Object::Head(head)) => Ok(Some(head)),
            Some(_) => Err(StoreError::KindMismatch(r.key())),
        }
    }

    pub fn get_index(&self, r: &Ref) -> StoreResult<Option<Index>> {
        match self.get(r)? {
            None => Ok(None),
            Some(Object::Index(index)) => Ok(Some(index)),
            Some(_) => Err(StoreError::KindMismatch(r.key())),
        }
    }

    /// Stores an object under its derived or minted id and returns the
    /// ref. For content-addressed kinds this is idempotent; rewriting an
    /// existing key with different bytes fails unless `return_existing`,
    /// in which case the existing ref is returned unchanged.
    pub fn put_with(&mut self, obj: &Object, return_existing: bool) -> StoreResult<Ref> {
        match pack::object_content_id(obj) {
            Some(id) => {
                let r = Ref::new(obj.kind(), id);
                let data = pack::pack_object(obj);
                match self.raw(&r)? {
                    Some(existing) if existing != data => {
                        if return_existing {
                            return Ok(r);
                        }
                        Err(StoreError::ImmutableOverwrite(r.key()))
                    }
                    Some(_) => Ok(r),
                    None => {
                        self.kv.put(Table::Kind(r.kind()), &r.key(), &data)?;
                        Ok(r)
                    }
                }
            }
            None => {
                if obj.kind() == ObjectKind::FnDag {
                    // Fndag ids derive from the argv datum, which this
                    // layer cannot see; callers compute the id and use
                    // put_at.
                    return Err(StoreError::ExplicitRefRequired("fndag"));
                }
                let r = Ref::new(obj.kind(), Id::random());
                self.put_at(&r, obj)?;
                Ok(r)
            }
        }
    }

    pub fn put(&mut self, obj: &Object) -> StoreResult<Ref> {
        self.put_with(obj, false)
    }

    /// Writes an object at a specific id, bypassing id derivation. Used
    /// for minted kinds whose id already exists, the fixed root commit,
    /// fndags, and dump loading.
    pub fn put_at(&mut self, r: &Ref, obj: &Object) -> StoreResult<Ref> {
        let data = pack::pack_object(obj);
        self.kv.put(Table::Kind(r.kind()), &r.key(), &data)?;
        Ok(r.clone())
    }

    pub fn delete(&mut self, r: &Ref) -> StoreResult<()> {
        Ok(self.kv.delete(Table::Kind(r.kind()), &r.key())?)
    }

    /// Enumerates refs of one kind in key order.
    pub fn cursor(&self, kind: ObjectKind) -> StoreResult<Vec<Ref>> {
        let mut refs = vec![];
        for key in self.kv.keys(Table::Kind(kind))? {
            let r = key
                .parse::<Ref>()
                .map_err(|_| StoreError::NotFound(key.clone()))?;
            refs.push(r);
        }
        Ok(refs)
    }

    pub fn heads(&self) -> StoreResult<Vec<Ref>> {
        self.cursor(ObjectKind::Head)
    }

    pub fn indexes(&self) -> StoreResult<Vec<Ref>> {
        self.cursor(ObjectKind::Index)
    }

    /// Every stored ref across all sub-tables.
    pub fn objects(&self) -> StoreResult<BTreeSet<Ref>> {
        let mut result = BTreeSet::new();
        for kind in ObjectKind::ALL {
            result.extend(self.cursor(kind)?);
        }
        Ok(result)
    }

    /// The set of refs transitively reachable from the roots. Never
    /// infinite: references only descend the acyclic object graph.
    /// Dangling refs are tolerated and terminate the walk at that edge.
    pub fn walk(&self, roots: &[Ref]) -> StoreResult<BTreeSet<Ref>> {
        let mut result = BTreeSet::new();
        let mut queue: VecDeque<Ref> = roots.iter().cloned().collect();
        while let Some(r) = queue.pop_front() {
            if !result.insert(r.clone()) {
                continue;
            }
            if let Some(obj) = self.get(&r)? {
                queue.extend(obj.child_refs());
            }
        }
        Ok(result)
    }

    /// Reachable refs in topological order: every object's dependencies
    /// appear before the object itself. This is the dump order.
    pub fn walk_ordered(&self, roots: &[Ref]) -> StoreResult<Vec<Ref>> {
        let mut visited = BTreeSet::new();
        let mut ordered = vec![];
        // Two-phase stack entries: first visit expands children, second
        // emits the node once all children are out.
        let mut stack: Vec<(Ref, bool)> = roots.iter().rev().map(|r| (r.clone(), false)).collect();
        while let Some((r, expanded)) = stack.pop() {
            if expanded {
                ordered.push(r);
                continue;
            }
            if !visited.insert(r.clone()) {
                continue;
            }
            let children = match self.get(&r)? {
                Some(obj) => obj.child_refs(),
                None => vec![],
            };
            stack.push((r, true));
            for child in children.into_iter().rev() {
                if !visited.contains(&child) {
                    stack.push((child, false));
                }
            }
        }
        Ok(ordered)
    }

    pub fn meta_get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.kv.get(Table::Meta, key)?)
    }

    pub fn meta_put(&mut self, key: &str, value: &[u8]) -> StoreResult<()> {
        Ok(self.kv.put(Table::Meta, key, value)?)
    }
}
