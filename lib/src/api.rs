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

//! The operation surface consumed by the command-line layer.
//!
//! `begin_dag` returns a token (the index ref) and `invoke` decodes
//! `[op, args, kwargs]` payloads against it, dispatching to the builder
//! operations and the built-in functions.

use std::fs;
use std::path::PathBuf;

use serde_json::json;

use crate::config::Config;
use crate::config::DEFAULT_BRANCH;
use crate::dag_builder;
use crate::dag_builder::NodeValue;
use crate::dispatch;
use crate::dispatch::StartFnOpts;
use crate::model::NodeData;
use crate::model::Resource;
use crate::model::Value;
use crate::object_id::ObjectKind;
use crate::object_id::Ref;
use crate::repo::Ctx;
use crate::repo::GcStats;
use crate::repo::Repo;
use crate::repo::RepoError;
use crate::repo::RepoResult;
use crate::store::Tx;
use crate::wire;

pub use crate::remote::clone_remote;
pub use crate::remote::create_remote;
pub use crate::remote::delete_remote;
pub use crate::remote::fetch_remote;
pub use crate::remote::list_remotes;
pub use crate::remote::pull_remote;
pub use crate::remote::push_remote;

///////////////////////////////////////////////////////////////////////////
// Repo
///////////////////////////////////////////////////////////////////////////

pub fn create_repo(config: &Config, name: &str) -> RepoResult<()> {
    Repo::create(&config.repo_dir().join(name), &config.user)?;
    Ok(())
}

pub fn delete_repo(config: &Config, name: &str) -> RepoResult<()> {
    let path = config.repo_dir().join(name);
    if !path.is_dir() {
        return Err(RepoError::NoSuchRepo(name.to_owned()));
    }
    fs::remove_dir_all(path)?;
    Ok(())
}

pub fn copy_repo(config: &Config, name: &str) -> RepoResult<()> {
    config.open_repo()?.copy(&config.repo_dir().join(name))
}

pub fn list_repos(config: &Config) -> RepoResult<Vec<(String, PathBuf)>> {
    let dir = config.repo_dir();
    if !dir.is_dir() {
        return Ok(vec![]);
    }
    let mut repos = vec![];
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        repos.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
    }
    repos.sort();
    Ok(repos)
}

pub fn gc_repo(config: &Config) -> RepoResult<GcStats> {
    config.open_repo()?.gc()
}

pub fn repo_path(config: &Config) -> RepoResult<PathBuf> {
    config.repo_path()
}

pub fn status(config: &Config) -> serde_json::Value {
    json!({
        "repo": config.repo,
        "branch": config.branch,
        "user": config.user,
        "config_dir": config.config_dir.to_string_lossy(),
        "project_dir": config.project_dir.to_string_lossy(),
    })
}

///////////////////////////////////////////////////////////////////////////
// Config
///////////////////////////////////////////////////////////////////////////

pub fn config_repo(config: &mut Config, name: &str) -> RepoResult<()> {
    if !list_repos(config)?.iter().any(|(n, _)| n == name) {
        return Err(RepoError::NoSuchRepo(name.to_owned()));
    }
    config.repo = Some(name.to_owned());
    config.branch = DEFAULT_BRANCH.to_owned();
    config.save_project()
}

pub fn config_branch(config: &mut Config, name: &str) -> RepoResult<()> {
    if !list_branches(config)?.iter().any(|b| b == name) {
        return Err(RepoError::NoSuchBranch(name.to_owned()));
    }
    config.branch = name.to_owned();
    config.save_project()
}

pub fn config_user(config: &mut Config, user: &str) -> RepoResult<()> {
    config.user = user.to_owned();
    config.save_project()
}

///////////////////////////////////////////////////////////////////////////
// Branch
///////////////////////////////////////////////////////////////////////////

pub fn current_branch(config: &Config) -> &str {
    &config.branch
}

pub fn list_branches(config: &Config) -> RepoResult<Vec<String>> {
    config.open_repo()?.branches()
}

pub fn create_branch(config: &mut Config, name: &str, commit: Option<&str>) -> RepoResult<()> {
    let repo = config.open_repo()?;
    let from = commit
        .map(|id| format!("commit/{id}").parse::<Ref>())
        .transpose()?;
    repo.create_branch(name, from.as_ref())?;
    config_branch(config, name)
}

pub fn delete_branch(config: &Config, name: &str) -> RepoResult<()> {
    config.open_repo()?.delete_branch(name)
}

pub fn use_branch(config: &mut Config, name: &str) -> RepoResult<()> {
    config_branch(config, name)
}

pub fn merge_branch(config: &Config, other: &str) -> RepoResult<String> {
    Ok(config.open_repo()?.merge_branch(other)?.id().to_owned())
}

pub fn rebase_branch(config: &Config, onto: &str) -> RepoResult<String> {
    Ok(config.open_repo()?.rebase_branch(onto)?.id().to_owned())
}

///////////////////////////////////////////////////////////////////////////
// Dag
///////////////////////////////////////////////////////////////////////////

pub fn list_dags(config: &Config) -> RepoResult<serde_json::Value> {
    let repo = config.open_repo()?;
    repo.read(|tx| {
        let mut dags = vec![];
        for (name, r) in Ctx::from_head(tx, repo.head())?.tree.dags {
            let dag = tx.get_dag(&r)?;
            dags.push(json!({
                "name": name,
                "id": r.key(),
                "result": dag.result.map(|n| n.key()),
                "error": dag.error.map(|err| wire::error_to_json(&err)),
            }));
        }
        Ok(serde_json::Value::Array(dags))
    })
}

pub fn delete_dag(config: &Config, name: &str, message: &str) -> RepoResult<String> {
    Ok(config
        .open_repo()?
        .delete_dag(name, message)?
        .id()
        .to_owned())
}

/// Starts building a named dag; the returned token is the index ref.
pub fn begin_dag(
    config: &Config,
    name: &str,
    message: &str,
    dump: Option<&str>,
) -> RepoResult<String> {
    let repo = config.open_repo()?;
    repo.write(|tx| {
        let dag = dump.map(|d| wire::load_ref(tx, d, true)).transpose()?;
        let index = dag_builder::begin(tx, repo.user(), repo.head(), name, message, dag)?;
        Ok(index.key())
    })
}

/// The topology of a dag: its nodes, dependency edges, and outcome.
pub fn describe_dag(config: &Config, dag: &str) -> RepoResult<serde_json::Value> {
    let repo = config.open_repo()?;
    repo.read(|tx| {
        let dag_ref = if dag.contains('/') {
            dag.parse::<Ref>()?
        } else {
            dag_builder::get_dag(tx, repo.head(), dag)?
                .ok_or_else(|| RepoError::NoSuchDag(dag.to_owned()))?
        };
        let dag = tx.get_dag(&dag_ref)?;
        let mut nodes = vec![];
        let mut edges = vec![];
        for node_ref in &dag.nodes {
            let node = tx.get_node(node_ref)?;
            let node_type = match &node.data {
                NodeData::Literal { .. } => "literal",
                NodeData::Import { .. } => "import",
                NodeData::Fn { .. } => "fn",
                NodeData::Argv { .. } => "argv",
            };
            nodes.push(json!({
                "id": node_ref.key(),
                "name": dag.name_of(node_ref),
                "doc": node.doc,
                "node_type": node_type,
            }));
            match &node.data {
                NodeData::Import { dag, .. } => edges.push(json!({
                    "source": node_ref.key(),
                    "target": dag.key(),
                    "type": "dag",
                })),
                NodeData::Fn { argv, .. } => {
                    for arg in argv {
                        edges.push(json!({
                            "source": arg.key(),
                            "target": node_ref.key(),
                            "type": "node",
                        }));
                    }
                }
                _ => {}
            }
        }
        Ok(json!({
            "id": dag_ref.key(),
            "argv": dag.argv.map(|r| r.key()),
            "nodes": nodes,
            "edges": edges,
            "result": dag.result.map(|r| r.key()),
            "error": dag.error.map(|err| wire::error_to_json(&err)),
        }))
    })
}

///////////////////////////////////////////////////////////////////////////
// Index
///////////////////////////////////////////////////////////////////////////

pub fn list_indexes(config: &Config) -> RepoResult<serde_json::Value> {
    let repo = config.open_repo()?;
    repo.read(|tx| {
        let mut indexes = vec![];
        for r in tx.indexes()? {
            let index = tx
                .get_index(&r)?
                .ok_or_else(|| RepoError::NoSuchIndex(r.key()))?;
            indexes.push(json!({
                "id": r.key(),
                "commit": index.commit.key(),
                "dag": index.dag.key(),
            }));
        }
        Ok(serde_json::Value::Array(indexes))
    })
}

pub fn delete_index(config: &Config, token: &str) -> RepoResult<()> {
    let index = parse_token(token)?;
    let repo = config.open_repo()?;
    repo.write(|tx| {
        tx.get_index(&index)?
            .ok_or_else(|| RepoError::NoSuchIndex(index.key()))?;
        tx.delete(&index)?;
        Ok(())
    })
}

///////////////////////////////////////////////////////////////////////////
// Commit
///////////////////////////////////////////////////////////////////////////

pub fn commit_log(config: &Config) -> RepoResult<serde_json::Value> {
    let repo = config.open_repo()?;
    let entries = repo
        .log()?
        .into_iter()
        .map(|(r, commit)| {
            json!({
                "id": r.key(),
                "parents": commit.parents.iter().map(Ref::key).collect::<Vec<_>>(),
                "author": commit.author,
                "message": commit.message,
                "created": commit.created,
                "modified": commit.modified,
            })
        })
        .collect();
    Ok(serde_json::Value::Array(entries))
}

pub fn revert_commit(_config: &Config, _commit: &str) -> RepoResult<()> {
    Err(RepoError::NotImplemented("commit revert"))
}

///////////////////////////////////////////////////////////////////////////
// Invoke
///////////////////////////////////////////////////////////////////////////

fn parse_token(token: &str) -> RepoResult<Ref> {
    let r: Ref = token
        .trim()
        .trim_matches('"')
        .parse()
        .map_err(|_| RepoError::Invoke(format!("invalid token: {token}")))?;
    if r.kind() != ObjectKind::Index {
        return Err(RepoError::Invoke(format!("invalid token: {token}")));
    }
    Ok(r)
}

#[derive(Debug, Default)]
struct Kwargs {
    name: Option<String>,
    doc: Option<String>,
    retry: bool,
    dag: Option<Ref>,
    node: Option<Ref>,
}

fn decode_kwargs(value: Option<&serde_json::Value>) -> RepoResult<Kwargs> {
    let mut kwargs = Kwargs::default();
    let Some(value) = value else {
        return Ok(kwargs);
    };
    let entries = value
        .as_object()
        .ok_or_else(|| RepoError::Invoke("kwargs must be an object".to_owned()))?;
    for (key, item) in entries {
        match key.as_str() {
            "name" => kwargs.name = opt_str(item)?,
            "doc" => kwargs.doc = opt_str(item)?,
            "retry" => {
                kwargs.retry = item
                    .as_bool()
                    .ok_or_else(|| RepoError::Invoke("retry must be a bool".to_owned()))?;
            }
            "dag" => kwargs.dag = opt_ref(item)?,
            "node" => kwargs.node = opt_ref(item)?,
            _ => return Err(RepoError::Invoke(format!("unknown kwarg: {key}"))),
        }
    }
    Ok(kwargs)
}

fn opt_str(value: &serde_json::Value) -> RepoResult<Option<String>> {
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s.clone())),
        _ => Err(RepoError::Invoke(format!("expected string, got {value}"))),
    }
}

fn opt_ref(value: &serde_json::Value) -> RepoResult<Option<Ref>> {
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(key) => Ok(Some(key.parse()?)),
        other => match wire::value_from_json(other)? {
            Value::Node(r) => Ok(Some(r)),
            _ => Err(RepoError::Invoke(format!("expected ref, got {other}"))),
        },
    }
}

fn node_arg(value: &serde_json::Value) -> RepoResult<Ref> {
    opt_ref(value)?.ok_or_else(|| RepoError::Invoke("expected a node ref".to_owned()))
}

fn node_value_to_json(value: NodeValue) -> serde_json::Value {
    match value {
        NodeValue::Value(value) => wire::value_to_json(&value),
        NodeValue::Error(err) => wire::error_to_json(&err),
        NodeValue::Pending => serde_json::Value::Null,
    }
}

fn ref_json(r: &Ref) -> serde_json::Value {
    json!(["Ref", r.key()])
}

/// Decodes a `[op, args, kwargs]` payload and dispatches it against the
/// index named by `token`.
pub fn invoke(
    config: &Config,
    token: &str,
    payload: &serde_json::Value,
) -> RepoResult<serde_json::Value> {
    let items = payload
        .as_array()
        .ok_or_else(|| RepoError::Invoke("payload must be [op, args, kwargs]".to_owned()))?;
    let (op, args, kwargs) = match items.as_slice() {
        [op, args] | [op, args, serde_json::Value::Null] => (op, args, None),
        [op, args, kwargs] => (op, args, Some(kwargs)),
        _ => return Err(RepoError::Invoke("payload must be [op, args, kwargs]".to_owned())),
    };
    let op = op
        .as_str()
        .ok_or_else(|| RepoError::Invoke("op must be a string".to_owned()))?;
    let args = args
        .as_array()
        .ok_or_else(|| RepoError::Invoke("args must be an array".to_owned()))?;
    let kwargs = decode_kwargs(kwargs)?;
    let index = parse_token(token)?;
    let repo = config.open_repo()?;

    if dispatch::BUILTIN_OPS.contains(&op) {
        let fn_name = format!("{}:{op}", dispatch::BUILTIN_SCHEME);
        return repo.write(|tx| {
            let fn_node = dispatch::put_literal(
                tx,
                &index,
                &Value::Resource(Resource::new(fn_name.clone())),
                Some(&fn_name),
                None,
                repo.cache_path(),
            )?;
            let mut argv = vec![fn_node];
            for arg in args {
                let value = wire::value_from_json(arg)?;
                argv.push(dispatch::put_literal(
                    tx,
                    &index,
                    &value,
                    None,
                    None,
                    repo.cache_path(),
                )?);
            }
            let opts = StartFnOpts {
                retry: kwargs.retry,
                name: kwargs.name.as_deref(),
                doc: kwargs.doc.as_deref(),
                cache_path: repo.cache_path(),
            };
            let node = dispatch::start_fn(tx, &index, &argv, opts)?;
            Ok(ref_json(&node))
        });
    }

    match op {
        "start_fn" => repo.write(|tx| {
            let [argv] = args.as_slice() else {
                return Err(RepoError::Invoke("start_fn takes one argv list".to_owned()));
            };
            let Value::List(nodes) = wire::value_from_json(argv)? else {
                return Err(RepoError::Invoke("argv must be a list of nodes".to_owned()));
            };
            let mut refs = vec![];
            for node in &nodes {
                match node {
                    Value::Node(r) => refs.push(r.clone()),
                    _ => return Err(RepoError::Invoke("argv must be a list of nodes".to_owned())),
                }
            }
            let opts = StartFnOpts {
                retry: kwargs.retry,
                name: kwargs.name.as_deref(),
                doc: kwargs.doc.as_deref(),
                cache_path: repo.cache_path(),
            };
            let node = dispatch::start_fn(tx, &index, &refs, opts)?;
            Ok(ref_json(&node))
        }),
        "put_literal" => repo.write(|tx| {
            let [data] = args.as_slice() else {
                return Err(RepoError::Invoke("put_literal takes one value".to_owned()));
            };
            let value = wire::value_from_json(data)?;
            let node = dispatch::put_literal(
                tx,
                &index,
                &value,
                kwargs.name.as_deref(),
                kwargs.doc.as_deref(),
                repo.cache_path(),
            )?;
            Ok(ref_json(&node))
        }),
        "put_load" => repo.write(|tx| {
            let dag_ref = match args.as_slice() {
                [serde_json::Value::String(name)] if !name.contains('/') => {
                    dag_builder::get_dag(tx, repo.head(), name)?
                        .ok_or_else(|| RepoError::NoSuchDag(name.clone()))?
                }
                [other] => opt_ref(other)?
                    .ok_or_else(|| RepoError::Invoke("put_load takes a dag".to_owned()))?,
                _ => return Err(RepoError::Invoke("put_load takes a dag".to_owned())),
            };
            let node = dag_builder::put_load(
                tx,
                &index,
                dag_ref,
                kwargs.node.clone(),
                kwargs.name.as_deref(),
                kwargs.doc.as_deref(),
            )?;
            Ok(ref_json(&node))
        }),
        "commit" => repo.write(|tx| {
            let [result] = args.as_slice() else {
                return Err(RepoError::Invoke("commit takes one result".to_owned()));
            };
            let res_or_err = match result {
                serde_json::Value::Null => {
                    return Err(RepoError::Invoke(
                        "commit requires a result or an error".to_owned(),
                    ));
                }
                value if value.get(0) == Some(&json!("Error")) => {
                    Err(wire::error_from_json(value)?)
                }
                value => Ok(node_arg(value)?),
            };
            let dag = dag_builder::commit(tx, repo.user(), repo.head(), res_or_err, &index)?;
            Ok(json!(wire::dump_ref(tx, &dag)?))
        }),
        "get_dag" => repo.read(|tx| {
            let dag_ref = match args.as_slice() {
                [serde_json::Value::String(name)] if !name.contains('/') => {
                    dag_builder::get_dag(tx, repo.head(), name)?
                        .ok_or_else(|| RepoError::NoSuchDag(name.clone()))?
                }
                [other] => {
                    let node = node_arg(other)?;
                    match tx.get_node(&node)?.data {
                        NodeData::Import { dag, .. } | NodeData::Fn { dag, .. } => dag,
                        _ => {
                            return Err(RepoError::Invoke(
                                "node does not reference a dag".to_owned(),
                            ));
                        }
                    }
                }
                _ => return Err(RepoError::Invoke("get_dag takes a name or node".to_owned())),
            };
            Ok(ref_json(&dag_ref))
        }),
        "get_names" => repo.read(|tx| {
            let dag = dag_of(tx, &index, kwargs.dag.as_ref())?;
            let names = dag_builder::get_names(tx, &dag)?;
            Ok(serde_json::Value::Array(
                std::iter::once(json!("d"))
                    .chain(names.iter().map(|(name, r)| json!([name, ref_json(r)])))
                    .collect(),
            ))
        }),
        "get_node" => repo.read(|tx| {
            let [serde_json::Value::String(name)] = args.as_slice() else {
                return Err(RepoError::Invoke("get_node takes a name".to_owned()));
            };
            let dag = dag_of(tx, &index, kwargs.dag.as_ref())?;
            let names = dag_builder::get_names(tx, &dag)?;
            let node = names
                .get(name)
                .ok_or_else(|| RepoError::Invoke(format!("no such node: {name}")))?;
            Ok(ref_json(node))
        }),
        "set_node" => repo.write(|tx| {
            let [serde_json::Value::String(name), node] = args.as_slice() else {
                return Err(RepoError::Invoke("set_node takes a name and node".to_owned()));
            };
            let node = dag_builder::set_node(tx, &index, name, &node_arg(node)?)?;
            Ok(ref_json(&node))
        }),
        "get_node_value" => repo.read(|tx| {
            let [node] = args.as_slice() else {
                return Err(RepoError::Invoke("get_node_value takes a node".to_owned()));
            };
            let value = dag_builder::resolve_node(tx, &node_arg(node)?)?;
            Ok(node_value_to_json(value))
        }),
        "get_argv" => repo.read(|tx| {
            let dag = dag_of(tx, &index, kwargs.dag.as_ref())?;
            match dag_builder::get_argv(tx, &dag)? {
                Some(argv) => Ok(ref_json(&argv)),
                None => Ok(serde_json::Value::Null),
            }
        }),
        "get_result" => repo.read(|tx| {
            let dag = dag_of(tx, &index, kwargs.dag.as_ref())?;
            match dag_builder::get_result(tx, &dag)? {
                Err(err) => Ok(wire::error_to_json(&err)),
                Ok(Some(node)) => Ok(ref_json(&node)),
                Ok(None) => Ok(serde_json::Value::Null),
            }
        }),
        "unroll" => repo.read(|tx| {
            let [node] = args.as_slice() else {
                return Err(RepoError::Invoke("unroll takes a node".to_owned()));
            };
            let value = dag_builder::resolve_node(tx, &node_arg(node)?)?;
            Ok(node_value_to_json(value))
        }),
        "dump" => repo.read(|tx| {
            let [node] = args.as_slice() else {
                return Err(RepoError::Invoke("dump takes a ref".to_owned()));
            };
            let r = node_arg(node)?;
            Ok(json!(wire::dump_ref(tx, &r)?))
        }),
        _ => Err(RepoError::NoSuchOp(op.to_owned())),
    }
}

/// The dag named by an explicit kwarg, defaulting to the index's own.
fn dag_of(tx: &Tx, index: &Ref, dag: Option<&Ref>) -> RepoResult<Ref> {
    match dag {
        Some(r) => Ok(r.clone()),
        None => Ok(tx
            .get_index(index)?
            .ok_or_else(|| RepoError::NoSuchIndex(index.key()))?
            .dag),
    }
}
