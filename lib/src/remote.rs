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

//! Remote synchronization.
//!
//! A remote is a named URI whose scheme selects a handler executable
//! `dml-remote-<scheme>-handler` found on PATH. The handler speaks a
//! three-command protocol over process I/O: `tag <uri>` prints the
//! current content tag, `get <uri> <tag>` prints the raw repository
//! file, and `put <uri> <tag>` reads the file from stdin; `get` and
//! `put` fail if the remote tag changed since, giving compare-and-swap.

use std::env;
use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::process::Stdio;

use tempfile::TempDir;

use crate::config::Config;
use crate::kv::DATA_FILE;
use crate::kv::Storage;
use crate::object_id::ObjectKind;
use crate::object_id::Ref;
use crate::repo::Repo;
use crate::repo::RepoError;
use crate::repo::RepoResult;
use crate::store::Tx;
use crate::wire;

/// Tag reported for a remote that has no content yet.
pub const DEFAULT_TAG: &str = "00000000000000000000000000000000";

/// A registered remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInfo {
    pub name: String,
    pub uri: String,
    pub path: PathBuf,
}

/// Name of the handler executable for a URI's scheme.
pub fn handler_name(uri: &str) -> RepoResult<String> {
    let scheme = uri
        .split_once(':')
        .map(|(scheme, _)| scheme)
        .filter(|scheme| !scheme.is_empty())
        .ok_or_else(|| RepoError::Invoke(format!("invalid remote uri: {uri}")))?;
    Ok(format!("dml-remote-{scheme}-handler"))
}

/// Locates the handler for a URI on PATH.
pub fn find_handler(uri: &str) -> RepoResult<PathBuf> {
    let name = handler_name(uri)?;
    let paths = env::var_os("PATH").unwrap_or_default();
    for dir in env::split_paths(&paths) {
        let candidate = dir.join(&name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(RepoError::HandlerNotFound(name))
}

pub fn create_remote(config: &Config, name: &str, uri: &str) -> RepoResult<()> {
    find_handler(uri)?;
    let path = config.remote_dir().join(name);
    if path.exists() {
        return Err(RepoError::RemoteExists(name.to_owned()));
    }
    fs::create_dir_all(&path)?;
    fs::write(path.join("uri"), uri)?;
    Ok(())
}

pub fn delete_remote(config: &Config, name: &str) -> RepoResult<()> {
    let path = config.remote_dir().join(name);
    if !path.is_dir() {
        return Err(RepoError::NoSuchRemote(name.to_owned()));
    }
    fs::remove_dir_all(path)?;
    Ok(())
}

pub fn list_remotes(config: &Config) -> RepoResult<Vec<RemoteInfo>> {
    let dir = config.remote_dir();
    if !dir.is_dir() {
        return Ok(vec![]);
    }
    let mut remotes = vec![];
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let uri = remote_uri(config, &name)?;
        remotes.push(RemoteInfo {
            name,
            uri,
            path: entry.path(),
        });
    }
    remotes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(remotes)
}

fn remote_uri(config: &Config, name: &str) -> RepoResult<String> {
    let path = config.remote_dir().join(name).join("uri");
    if !path.is_file() {
        return Err(RepoError::NoSuchRemote(name.to_owned()));
    }
    Ok(fs::read_to_string(path)?.trim().to_owned())
}

/// Fetches the remote repository file into `<config>/repo/<repo>`.
pub fn clone_remote(config: &Config, name: &str, repo: &str) -> RepoResult<PathBuf> {
    let dest = config.repo_dir().join(repo);
    let (_tag, _uri) = download(config, name, &dest)?;
    Ok(dest)
}

/// Downloads every remote head into the local repository under the
/// namespaced branches `head/<remote>/<branch>`.
pub fn fetch_remote(config: &Config, name: &str) -> RepoResult<()> {
    let staging = TempDir::new()?;
    let remote_dir = staging.path().join("repo");
    download(config, name, &remote_dir)?;

    let remote_storage = Storage::open(&remote_dir)?;
    let remote_tx = Tx::begin(&remote_storage, false)?;
    let local = config.open_repo()?;
    local.write(|tx| {
        for head in remote_tx.heads()? {
            let dump = wire::dump_ref(&remote_tx, &head)?;
            let namespaced = format!("{name}/{}", head.id());
            let dump = rewrite_root_head(&dump, &namespaced)?;
            wire::load_ref(tx, &dump, true)?;
        }
        Ok(())
    })
}

/// Fetches, then merges the remote's copy of the current branch into it.
pub fn pull_remote(config: &Config, name: &str) -> RepoResult<Ref> {
    fetch_remote(config, name)?;
    let repo = config.open_repo()?;
    repo.merge_branch(&format!("{name}/{}", config.branch))
}

/// Merges our branch into a staged copy of the remote repository and
/// uploads it, compare-and-swapping on the tag observed before staging.
pub fn push_remote(config: &Config, name: &str) -> RepoResult<()> {
    let uri = remote_uri(config, name)?;
    let handler = find_handler(&uri)?;
    let tag = run_handler(&handler, &["tag", &uri], None)?;
    let tag = String::from_utf8_lossy(&tag).trim().to_owned();

    let staging = TempDir::new()?;
    let remote_dir = staging.path().join("repo");
    let local = config.open_repo()?;
    if tag == DEFAULT_TAG {
        // Empty remote: the first push uploads our repository wholesale.
        local.copy(&remote_dir)?;
    } else {
        fs::create_dir_all(&remote_dir)?;
        let bytes = run_handler(&handler, &["get", &uri, &tag], None)?;
        fs::write(remote_dir.join(DATA_FILE), bytes)?;

        // Stage our branch under a scratch head, merge it into the
        // remote's branch, then drop the scratch head.
        let dump = local.read(|tx| wire::dump_ref(tx, local.head()))?;
        let scratch = format!("push/{}", config.branch);
        let dump = rewrite_root_head(&dump, &scratch)?;
        let remote_repo = Repo::open(&remote_dir, &config.user, Some(&config.branch))?;
        remote_repo.write(|tx| {
            wire::load_ref(tx, &dump, true)?;
            Ok(())
        })?;
        remote_repo.merge_branch(&scratch)?;
        remote_repo.delete_branch(&scratch)?;
    }
    let bytes = fs::read(remote_dir.join(DATA_FILE))?;
    run_handler(&handler, &["put", &uri, &tag], Some(&bytes))?;
    Ok(())
}

/// Runs `tag` + `get` against a remote and writes the repository file
/// into `dest`, returning the observed tag and uri.
fn download(config: &Config, name: &str, dest: &Path) -> RepoResult<(String, String)> {
    let uri = remote_uri(config, name)?;
    let handler = find_handler(&uri)?;
    let file = dest.join(DATA_FILE);
    if file.exists() {
        return Err(RepoError::Invoke(format!(
            "repo already exists: {}",
            file.display()
        )));
    }
    let tag = run_handler(&handler, &["tag", &uri], None)?;
    let tag = String::from_utf8_lossy(&tag).trim().to_owned();
    let bytes = run_handler(&handler, &["get", &uri, &tag], None)?;
    fs::create_dir_all(dest)?;
    fs::write(file, bytes)?;
    Ok((tag, uri))
}

/// Rewrites the root (last) pair of a head dump to a different branch
/// name.
fn rewrite_root_head(dump: &str, branch: &str) -> RepoResult<String> {
    let mut pairs: Vec<serde_json::Value> = serde_json::from_str(dump)?;
    let last = pairs
        .last_mut()
        .ok_or_else(|| RepoError::Wire("empty dump".to_owned()))?;
    let root: Ref = last
        .get(0)
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| RepoError::Wire("malformed dump root".to_owned()))?
        .parse()?;
    if root.kind() != ObjectKind::Head {
        return Err(RepoError::Wire(format!("not a head dump: {}", root.key())));
    }
    last[0] = serde_json::Value::String(Ref::head(branch).key());
    Ok(serde_json::to_string(&pairs)?)
}

/// Invokes a handler subcommand, feeding `stdin` when given and
/// returning its stdout. A nonzero exit surfaces the handler's stderr.
fn run_handler(handler: &Path, args: &[&str], stdin: Option<&[u8]>) -> RepoResult<Vec<u8>> {
    tracing::debug!(handler = %handler.display(), ?args, "spawning remote handler");
    let mut command = Command::new(handler);
    command
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command.spawn().map_err(|err| RepoError::Handler {
        handler: handler.display().to_string(),
        message: format!("could not execute: {err}"),
    })?;
    if let Some(bytes) = stdin {
        child
            .stdin
            .take()
            .expect("stdin should be piped")
            .write_all(bytes)?;
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(RepoError::Handler {
            handler: handler.display().to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_name() {
        assert_eq!(
            handler_name("file:///tmp/repo").unwrap(),
            "dml-remote-file-handler"
        );
        assert_eq!(
            handler_name("s3://bucket/key").unwrap(),
            "dml-remote-s3-handler"
        );
        assert!(handler_name("no-scheme").is_err());
    }
}
