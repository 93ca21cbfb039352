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

//! The commit algebra: ancestor walks, merge-base, tree diff/patch,
//! three-way merge, rebase, and squash.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;

use crate::model::Commit;
use crate::model::Head;
use crate::model::Index;
use crate::model::Object;
use crate::model::timestamp_now;
use crate::object_id::Ref;
use crate::repo::RepoError;
use crate::repo::RepoResult;
use crate::store::Tx;

/// Ancestors of the given commits in depth-first order, each commit
/// before its parents.
pub fn topo_sort(tx: &Tx, roots: &[Ref]) -> RepoResult<Vec<Ref>> {
    let mut result = vec![];
    let mut seen = HashSet::new();
    let mut queue: Vec<Ref> = roots.to_vec();
    while !queue.is_empty() {
        let r = queue.remove(0);
        if !seen.insert(r.clone()) {
            continue;
        }
        let Some(Object::Commit(commit)) = tx.get(&r)? else {
            continue;
        };
        result.push(r);
        let mut rest = commit.parents;
        rest.extend(queue);
        queue = rest;
    }
    Ok(result)
}

/// The most recent common ancestor of `a` and `b`.
///
/// Iterates by pivoting on the most ancestral commit reachable from `a`
/// but not from `b`; each pivot strictly shrinks the candidate set, so
/// the loop terminates.
pub fn merge_base(tx: &Tx, a: &Ref, b: &Ref) -> RepoResult<Ref> {
    let mut a = a.clone();
    let mut b = b.clone();
    loop {
        let aa = topo_sort(tx, std::slice::from_ref(&a))?;
        let ab = topo_sort(tx, std::slice::from_ref(&b))?;
        let sa: HashSet<&Ref> = aa.iter().collect();
        let sb: HashSet<&Ref> = ab.iter().collect();
        if sa.is_subset(&sb) {
            return Ok(a);
        }
        if sb.is_subset(&sa) {
            return Ok(b);
        }
        let pivot = aa
            .iter()
            .rev()
            .find(|r| !sb.contains(*r))
            .expect("non-subset ancestries have a pivot")
            .clone();
        let commit = tx.get_commit(&pivot)?;
        match commit.parents.as_slice() {
            [parent] => return Ok(parent.clone()),
            [first, second] => {
                a = first.clone();
                b = second.clone();
            }
            _ => return Err(RepoError::MalformedCommit(pivot.key())),
        }
    }
}

/// The name-level difference between two trees.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeDiff {
    pub add: BTreeMap<String, Ref>,
    pub rem: BTreeMap<String, Ref>,
}

pub fn diff(tx: &Tx, t1: &Ref, t2: &Ref) -> RepoResult<TreeDiff> {
    let d1 = tx.get_tree(t1)?.dags;
    let d2 = tx.get_tree(t2)?.dags;
    let mut result = TreeDiff::default();
    let names: HashSet<&String> = d1.keys().chain(d2.keys()).collect();
    for name in names {
        match (d1.get(name), d2.get(name)) {
            (Some(old), None) => {
                result.rem.insert(name.clone(), old.clone());
            }
            (None, Some(new)) => {
                result.add.insert(name.clone(), new.clone());
            }
            (Some(old), Some(new)) if old != new => {
                result.rem.insert(name.clone(), old.clone());
                result.add.insert(name.clone(), new.clone());
            }
            _ => {}
        }
    }
    Ok(result)
}

/// Applies diffs to a tree and stores the result. Diffs merge left to
/// right with later additions winning.
pub fn patch(tx: &mut Tx, tree: &Ref, diffs: &[TreeDiff]) -> RepoResult<Ref> {
    let mut merged = TreeDiff::default();
    for d in diffs {
        merged.add.extend(d.add.clone());
        merged.rem.extend(d.rem.clone());
    }
    let mut tree = tx.get_tree(tree)?;
    for name in merged.rem.keys() {
        tree.dags.remove(name);
    }
    tree.dags.extend(merged.add);
    Ok(tx.put(&Object::Tree(tree))?)
}

/// Three-way merge of two commits, degenerating to fast-forward when one
/// contains the other.
pub fn merge(tx: &mut Tx, user: &str, c1: &Ref, c2: &Ref) -> RepoResult<Ref> {
    merge_with(tx, user, c1, c2, None, None, None)
}

pub fn merge_with(
    tx: &mut Tx,
    user: &str,
    c1: &Ref,
    c2: &Ref,
    author: Option<&str>,
    message: Option<&str>,
    created: Option<&str>,
) -> RepoResult<Ref> {
    if c1 == c2 {
        return Ok(c2.clone());
    }
    let c0 = merge_base(tx, c1, c2)?;
    if &c0 == c2 {
        return Ok(c1.clone());
    }
    if &c0 == c1 {
        return Ok(c2.clone());
    }
    let base_tree = tx.get_commit(&c0)?.tree;
    let tree1 = tx.get_commit(c1)?.tree;
    let tree2 = tx.get_commit(c2)?.tree;
    let d1 = diff(tx, &base_tree, &tree1)?;
    let d2 = diff(tx, &base_tree, &tree2)?;
    let tree = patch(tx, &tree1, &[d1, d2])?;
    let now = timestamp_now();
    let commit = Commit {
        parents: vec![c1.clone(), c2.clone()],
        tree,
        author: author.unwrap_or(user).to_owned(),
        committer: user.to_owned(),
        message: message
            .map(str::to_owned)
            .unwrap_or_else(|| format!("merge {} with {}", c2.id(), c1.id())),
        created: created.map(str::to_owned).unwrap_or_else(|| now.clone()),
        modified: now,
    };
    Ok(tx.put(&Object::Commit(commit))?)
}

/// Replays `c2` onto `c1`, preserving author, message, and creation time
/// of every replayed commit.
pub fn rebase(tx: &mut Tx, user: &str, c1: &Ref, c2: &Ref) -> RepoResult<Ref> {
    let c0 = merge_base(tx, c1, c2)?;
    if &c0 == c1 {
        return Ok(c2.clone());
    }
    if &c0 == c2 {
        return Ok(c1.clone());
    }
    let mut replayed: HashMap<Ref, Ref> = HashMap::new();
    replay(tx, user, &c0, c1, c2, &mut replayed)
}

fn replay(
    tx: &mut Tx,
    user: &str,
    base: &Ref,
    onto: &Ref,
    commit_ref: &Ref,
    replayed: &mut HashMap<Ref, Ref>,
) -> RepoResult<Ref> {
    if commit_ref == base {
        return Ok(onto.clone());
    }
    if let Some(done) = replayed.get(commit_ref) {
        return Ok(done.clone());
    }
    let commit = tx.get_commit(commit_ref)?;
    let parents = commit.parents.clone();
    let result = match parents.as_slice() {
        [] => return Err(RepoError::MalformedCommit(commit_ref.key())),
        [parent] => {
            let x = replay(tx, user, base, onto, parent, replayed)?;
            let x_tree = tx.get_commit(&x)?.tree;
            let parent_tree = tx.get_commit(parent)?.tree;
            let d = diff(tx, &parent_tree, &commit.tree)?;
            let tree = patch(tx, &x_tree, &[d])?;
            let replayed_commit = Commit {
                parents: vec![x],
                tree,
                committer: user.to_owned(),
                modified: timestamp_now(),
                ..commit
            };
            tx.put(&Object::Commit(replayed_commit))?
        }
        [first, second] => {
            let a = replay(tx, user, base, onto, first, replayed)?;
            let b = replay(tx, user, base, onto, second, replayed)?;
            merge_with(
                tx,
                user,
                &a,
                &b,
                Some(&commit.author),
                Some(&commit.message),
                Some(&commit.created),
            )?
        }
        _ => return Err(RepoError::MalformedCommit(commit_ref.key())),
    };
    replayed.insert(commit_ref.clone(), result.clone());
    Ok(result)
}

/// Collapses the history between an ancestor `c1` and a descendant `c2`
/// into a single commit parented on `c1`, then reparents every reachable
/// downstream commit (and the heads and indexes that point at them).
pub fn squash(tx: &mut Tx, user: &str, c1: &Ref, c2: &Ref) -> RepoResult<Ref> {
    if merge_base(tx, c1, c2)? != *c1 {
        return Err(RepoError::NotAnAncestor {
            ancestor: c1.key(),
            descendant: c2.key(),
        });
    }
    let old = tx.get_commit(c2)?;
    let tree1 = tx.get_commit(c1)?.tree;
    let d = diff(tx, &tree1, &old.tree)?;
    let tree = patch(tx, &tree1, &[d])?;
    let squashed = Commit {
        parents: vec![c1.clone()],
        tree,
        author: old.author,
        committer: user.to_owned(),
        message: old.message,
        created: old.created,
        modified: timestamp_now(),
    };
    let new_ref = tx.put(&Object::Commit(squashed))?;

    let mut rewritten: HashMap<Ref, Ref> = HashMap::from([(c2.clone(), new_ref.clone())]);
    let mut pointer_roots = tx.heads()?;
    pointer_roots.extend(tx.indexes()?);
    let mut commit_roots = vec![];
    for r in &pointer_roots {
        match tx.get_existing(r)? {
            Object::Head(head) => commit_roots.push(head.commit),
            Object::Index(index) => commit_roots.push(index.commit),
            _ => {}
        }
    }
    // Ancestors-first so a rewritten parent is in the map before its
    // children are visited.
    let mut ordered = topo_sort(tx, &commit_roots)?;
    ordered.reverse();
    for r in ordered {
        let commit = tx.get_commit(&r)?;
        if !commit.parents.iter().any(|p| rewritten.contains_key(p)) {
            continue;
        }
        let new_parents = commit
            .parents
            .iter()
            .map(|p| rewritten.get(p).unwrap_or(p).clone())
            .collect();
        let reparented = Commit {
            parents: new_parents,
            ..commit
        };
        let new = tx.put(&Object::Commit(reparented))?;
        rewritten.insert(r, new);
    }
    for r in pointer_roots {
        match tx.get_existing(&r)? {
            Object::Head(head) => {
                if let Some(new) = rewritten.get(&head.commit) {
                    tx.put_at(&r, &Object::Head(Head {
                        commit: new.clone(),
                    }))?;
                }
            }
            Object::Index(index) => {
                if let Some(new) = rewritten.get(&index.commit) {
                    tx.put_at(&r, &Object::Index(Index {
                        commit: new.clone(),
                        dag: index.dag,
                    }))?;
                }
            }
            _ => {}
        }
    }
    Ok(new_ref)
}
