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

//! The repository handle: initialization, branch bookkeeping, history
//! listing, and garbage collection.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;
use tracing::instrument;

use crate::kv::KvError;
use crate::kv::Storage;
use crate::merge;
use crate::model::Commit;
use crate::model::Datum;
use crate::model::ErrorValue;
use crate::model::Head;
use crate::model::Object;
use crate::model::Resource;
use crate::model::Tree;
use crate::object_id::Id;
use crate::object_id::ObjectKind;
use crate::object_id::Ref;
use crate::object_id::RefParseError;
use crate::store::StoreError;
use crate::store::Tx;

/// Timestamp of the root commit shared by every repository. The root is
/// written at the fixed all-zeros id with fully deterministic content so
/// that unrelated repositories still share a common ancestor.
const ROOT_TIMESTAMP: &str = "1970-01-01T00:00:00.000000Z";

#[derive(Debug, Error)]
pub enum RepoError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Ref(#[from] RefParseError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("no such branch: {0}")]
    NoSuchBranch(String),
    #[error("branch already exists: {0}")]
    BranchExists(String),
    #[error("cannot delete the current branch")]
    CurrentBranch,
    #[error("dag has been committed already")]
    DagCommitted,
    #[error("no such dag: {0}")]
    NoSuchDag(String),
    #[error("no such index: {0}")]
    NoSuchIndex(String),
    #[error("malformed commit: {0}")]
    MalformedCommit(String),
    #[error("{ancestor} is not an ancestor of {descendant}")]
    NotAnAncestor {
        ancestor: String,
        descendant: String,
    },
    #[error("no such op: {0}")]
    NoSuchOp(String),
    #[error("invalid invocation: {0}")]
    Invoke(String),
    #[error("invalid wire data: {0}")]
    Wire(String),
    #[error("adapter {adapter} failed: {message}")]
    Adapter { adapter: String, message: String },
    #[error("protocol handler not found on PATH: {0}")]
    HandlerNotFound(String),
    #[error("remote handler {handler} failed: {message}")]
    Handler { handler: String, message: String },
    #[error("no such remote: {0}")]
    NoSuchRemote(String),
    #[error("remote already exists: {0}")]
    RemoteExists(String),
    #[error("no such repo: {0}")]
    NoSuchRepo(String),
    #[error("no repo selected")]
    NoRepo,
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}

impl RepoError {
    /// Short machine-readable code, used when a failure is recorded as a
    /// stored [`ErrorValue`].
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store(StoreError::ImmutableOverwrite(_)) => "immutable",
            Self::Store(StoreError::NotFound(_)) => "not_found",
            Self::Store(_) | Self::Kv(_) => "store",
            Self::Ref(_) => "ref",
            Self::Json(_) => "json",
            Self::Io(_) => "io",
            Self::NoSuchBranch(_) | Self::BranchExists(_) | Self::CurrentBranch => "branch",
            Self::DagCommitted | Self::NoSuchDag(_) => "dag",
            Self::NoSuchIndex(_) => "index",
            Self::MalformedCommit(_) | Self::NotAnAncestor { .. } => "commit",
            Self::NoSuchOp(_) | Self::Invoke(_) => "invoke",
            Self::Wire(_) => "wire",
            Self::Adapter { .. } => "adapter",
            Self::HandlerNotFound(_) | Self::Handler { .. } => "remote",
            Self::NoSuchRemote(_) | Self::RemoteExists(_) => "remote",
            Self::NoSuchRepo(_) | Self::NoRepo => "repo",
            Self::NotImplemented(_) => "unimplemented",
        }
    }
}

impl From<&RepoError> for ErrorValue {
    fn from(err: &RepoError) -> Self {
        Self::with_code(err.to_string(), err.code())
    }
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Resolved pointers from a head down to its tree, the working context of
/// most branch-level operations.
pub struct Ctx {
    pub head: Head,
    pub commit_ref: Ref,
    pub commit: Commit,
    pub tree_ref: Ref,
    pub tree: Tree,
}

impl Ctx {
    pub fn from_head(tx: &Tx, head_ref: &Ref) -> RepoResult<Self> {
        let head = tx
            .get_head(head_ref)?
            .ok_or_else(|| RepoError::NoSuchBranch(head_ref.id().to_owned()))?;
        let commit = tx.get_commit(&head.commit)?;
        let tree = tx.get_tree(&commit.tree)?;
        Ok(Self {
            commit_ref: head.commit.clone(),
            tree_ref: commit.tree.clone(),
            head,
            commit,
            tree,
        })
    }
}

/// Per-kind deletion counts and the resources extracted from deleted
/// datum leaves, reported by [`Repo::gc`].
#[derive(Debug, Default, PartialEq)]
pub struct GcStats {
    pub deleted: BTreeMap<&'static str, usize>,
    pub resources: Vec<Resource>,
}

impl GcStats {
    pub fn total(&self) -> usize {
        self.deleted.values().sum()
    }
}

/// A single-writer repository handle. Holds the storage environment, the
/// acting user, and the checked-out branch; all object access goes
/// through explicitly threaded transactions.
#[derive(Debug)]
pub struct Repo {
    storage: Storage,
    user: String,
    head: Ref,
    cache_path: PathBuf,
}

impl Repo {
    /// Creates a new repository at `path` and initializes it: an empty
    /// tree, the deterministic root commit at the all-zeros id, the
    /// default branch, and the `/init` marker.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn create(path: &Path, user: impl Into<String>) -> RepoResult<Self> {
        let storage = Storage::create(path)?;
        let repo = Self {
            storage,
            user: user.into(),
            head: Ref::default_head(),
            cache_path: path.join("cache"),
        };
        repo.write(|tx| {
            if tx.meta_get("/init")?.is_none() {
                let tree = tx.put(&Object::Tree(Tree::default()))?;
                let root = Commit {
                    parents: vec![],
                    tree,
                    author: String::new(),
                    committer: String::new(),
                    message: "initial commit".to_owned(),
                    created: ROOT_TIMESTAMP.to_owned(),
                    modified: ROOT_TIMESTAMP.to_owned(),
                };
                let root_ref = Ref::new(ObjectKind::Commit, Id::root());
                tx.put_at(&root_ref, &Object::Commit(root))?;
                tx.put_at(
                    &Ref::default_head(),
                    &Object::Head(Head { commit: root_ref }),
                )?;
                tx.meta_put("/init", Id::random().hex().as_bytes())?;
            }
            Ok(())
        })?;
        Ok(repo)
    }

    /// Opens an existing repository, checking out the given branch (or
    /// `main`).
    pub fn open(path: &Path, user: impl Into<String>, branch: Option<&str>) -> RepoResult<Self> {
        let storage = Storage::open(path)?;
        let head = branch.map_or_else(Ref::default_head, Ref::head);
        let repo = Self {
            storage,
            user: user.into(),
            head: head.clone(),
            cache_path: path.join("cache"),
        };
        repo.read(|tx| {
            tx.get_head(&head)?
                .ok_or_else(|| RepoError::NoSuchBranch(head.id().to_owned()))?;
            Ok(())
        })?;
        Ok(repo)
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn head(&self) -> &Ref {
        &self.head
    }

    pub fn path(&self) -> &Path {
        self.storage.path()
    }

    /// Path of the sibling cache environment handed to adapters.
    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Runs `f` inside a read transaction.
    pub fn read<T>(&self, f: impl FnOnce(&Tx) -> RepoResult<T>) -> RepoResult<T> {
        let tx = Tx::begin(&self.storage, false)?;
        f(&tx)
    }

    /// Runs `f` inside a write transaction, committing on success. An
    /// error abandons the transaction and discards every write made in
    /// the scope.
    pub fn write<T>(&self, f: impl FnOnce(&mut Tx) -> RepoResult<T>) -> RepoResult<T> {
        let mut tx = Tx::begin(&self.storage, true)?;
        let result = f(&mut tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Copies the repository environment into another directory.
    pub fn copy(&self, dest: &Path) -> RepoResult<()> {
        Ok(self.storage.copy_to(dest)?)
    }

    /// Switches the handle to another branch.
    pub fn checkout(&mut self, branch: &str) -> RepoResult<()> {
        let head = Ref::head(branch);
        self.read(|tx| {
            tx.get_head(&head)?
                .ok_or_else(|| RepoError::NoSuchBranch(branch.to_owned()))?;
            Ok(())
        })?;
        self.head = head;
        Ok(())
    }

    /// Creates a branch pointing where `from` points: another branch, or
    /// a commit.
    pub fn create_branch(&self, name: &str, from: Option<&Ref>) -> RepoResult<Ref> {
        let branch = Ref::head(name);
        self.write(|tx| {
            if tx.get_head(&branch)?.is_some() {
                return Err(RepoError::BranchExists(name.to_owned()));
            }
            let commit = match from {
                None => Ctx::from_head(tx, &self.head)?.commit_ref,
                Some(r) if r.kind() == ObjectKind::Commit => {
                    tx.get_commit(r)?;
                    r.clone()
                }
                Some(r) if r.kind() == ObjectKind::Head => {
                    tx.get_head(r)?
                        .ok_or_else(|| RepoError::NoSuchBranch(r.id().to_owned()))?
                        .commit
                }
                Some(r) => return Err(RepoError::Invoke(format!("unexpected ref: {}", r.key()))),
            };
            tx.put_at(&branch, &Object::Head(Head { commit }))?;
            Ok(branch.clone())
        })
    }

    /// Deletes a branch. The currently checked-out branch is rejected.
    pub fn delete_branch(&self, name: &str) -> RepoResult<()> {
        let branch = Ref::head(name);
        if branch == self.head {
            return Err(RepoError::CurrentBranch);
        }
        self.write(|tx| {
            tx.get_head(&branch)?
                .ok_or_else(|| RepoError::NoSuchBranch(name.to_owned()))?;
            tx.delete(&branch)
                .map_err(Into::into)
        })
    }

    /// Branch names, sorted.
    pub fn branches(&self) -> RepoResult<Vec<String>> {
        self.read(|tx| {
            Ok(tx
                .heads()?
                .into_iter()
                .map(|r| r.id().to_owned())
                .collect())
        })
    }

    /// Moves a branch pointer to a commit.
    pub fn set_head(&self, head: &Ref, commit: Ref) -> RepoResult<()> {
        self.write(|tx| {
            tx.put_at(head, &Object::Head(Head { commit }))?;
            Ok(())
        })
    }

    /// Merges another branch into the current one and advances the head.
    pub fn merge_branch(&self, other: &str) -> RepoResult<Ref> {
        self.write(|tx| {
            let ours = Ctx::from_head(tx, &self.head)?.commit_ref;
            let theirs = Ctx::from_head(tx, &Ref::head(other))?.commit_ref;
            let merged = merge::merge(tx, &self.user, &ours, &theirs)?;
            tx.put_at(&self.head, &Object::Head(Head {
                commit: merged.clone(),
            }))?;
            Ok(merged)
        })
    }

    /// Replays the current branch onto another and advances the head.
    pub fn rebase_branch(&self, onto: &str) -> RepoResult<Ref> {
        self.write(|tx| {
            let ours = Ctx::from_head(tx, &self.head)?.commit_ref;
            let base = Ctx::from_head(tx, &Ref::head(onto))?.commit_ref;
            let rebased = merge::rebase(tx, &self.user, &base, &ours)?;
            tx.put_at(&self.head, &Object::Head(Head {
                commit: rebased.clone(),
            }))?;
            Ok(rebased)
        })
    }

    /// The named dags visible from the current branch tip.
    pub fn dags(&self) -> RepoResult<BTreeMap<String, Ref>> {
        self.read(|tx| Ok(Ctx::from_head(tx, &self.head)?.tree.dags))
    }

    /// Commits a tree with one dag removed.
    pub fn delete_dag(&self, name: &str, message: &str) -> RepoResult<Ref> {
        self.write(|tx| {
            let ctx = Ctx::from_head(tx, &self.head)?;
            let mut tree = ctx.tree;
            if tree.dags.remove(name).is_none() {
                return Err(RepoError::NoSuchDag(name.to_owned()));
            }
            let tree = tx.put(&Object::Tree(tree))?;
            let commit = Commit::new(vec![ctx.commit_ref], tree, &self.user, message);
            let commit = tx.put(&Object::Commit(commit))?;
            tx.put_at(&self.head, &Object::Head(Head {
                commit: commit.clone(),
            }))?;
            Ok(commit)
        })
    }

    /// Ancestry of the current branch tip, most recent first.
    pub fn log(&self) -> RepoResult<Vec<(Ref, Commit)>> {
        self.read(|tx| {
            let tip = Ctx::from_head(tx, &self.head)?.commit_ref;
            let mut entries = vec![];
            for r in merge::topo_sort(tx, &[tip])? {
                let commit = tx.get_commit(&r)?;
                entries.push((r, commit));
            }
            Ok(entries)
        })
    }

    /// Deletes every object unreachable from the heads and in-flight
    /// indexes. Resources found in deleted datum leaves are returned so
    /// callers can arrange external cleanup.
    #[instrument(skip_all)]
    pub fn gc(&self) -> RepoResult<GcStats> {
        self.write(|tx| {
            let mut roots = tx.heads()?;
            roots.extend(tx.indexes()?);
            let reachable = tx.walk(&roots)?;
            let mut stats = GcStats::default();
            for r in tx.objects()? {
                if reachable.contains(&r) {
                    continue;
                }
                if let Some(Object::Datum(Datum::Resource(resource))) = tx.get(&r)? {
                    stats.resources.push(resource);
                }
                tx.delete(&r)?;
                *stats.deleted.entry(r.kind().name()).or_default() += 1;
            }
            tracing::debug!(deleted = stats.total(), "garbage collected");
            Ok(stats)
        })
    }
}
