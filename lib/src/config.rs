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

//! Configuration resolution.
//!
//! Settings come from the environment (`DML_CONFIG_DIR`, `DML_PROJECT_DIR`,
//! `DML_REPO`, `DML_BRANCH`, `DML_USER`, `DML_REPO_PATH`) layered over the
//! project dotfile `<project_dir>/config` (JSON `{repo, branch, user}`)
//! layered over defaults. The environment wins over the file; command-line
//! flags win over both by mutating the resolved [`Config`].

use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::object_id::Ref;
use crate::repo::Repo;
use crate::repo::RepoError;
use crate::repo::RepoResult;

pub const DEFAULT_BRANCH: &str = "main";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ProjectConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
}

/// Resolved configuration for one invocation.
#[derive(Debug, Clone)]
pub struct Config {
    pub config_dir: PathBuf,
    pub project_dir: PathBuf,
    pub repo: Option<String>,
    pub branch: String,
    pub user: String,
    repo_path_override: Option<PathBuf>,
}

impl Config {
    /// A configuration rooted at explicit directories, with no repo
    /// selected and defaults everywhere else.
    pub fn new(config_dir: PathBuf, project_dir: PathBuf) -> Self {
        Self {
            config_dir,
            project_dir,
            repo: None,
            branch: DEFAULT_BRANCH.to_owned(),
            user: default_user(),
            repo_path_override: None,
        }
    }

    /// Resolves configuration from the environment and the project
    /// dotfile.
    pub fn from_env() -> Self {
        let config_dir = env::var_os("DML_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env::var_os("HOME").map_or_else(|| PathBuf::from("."), PathBuf::from);
                home.join(".local").join("dml")
            });
        let project_dir = env::var_os("DML_PROJECT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".dml"));
        let project = read_project(&project_dir);
        let repo = env::var("DML_REPO").ok().or(project.repo);
        let branch = env::var("DML_BRANCH")
            .ok()
            .or(project.branch)
            .unwrap_or_else(|| DEFAULT_BRANCH.to_owned());
        let user = env::var("DML_USER")
            .ok()
            .or(project.user)
            .unwrap_or_else(default_user);
        let repo_path_override = env::var_os("DML_REPO_PATH").map(PathBuf::from);
        Self {
            config_dir,
            project_dir,
            repo,
            branch,
            user,
            repo_path_override,
        }
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.config_dir.join("repo")
    }

    pub fn remote_dir(&self) -> PathBuf {
        self.config_dir.join("remote")
    }

    /// Path of the selected repository's environment.
    pub fn repo_path(&self) -> RepoResult<PathBuf> {
        if let Some(path) = &self.repo_path_override {
            return Ok(path.clone());
        }
        let repo = self.repo.as_deref().ok_or(RepoError::NoRepo)?;
        Ok(self.repo_dir().join(repo))
    }

    /// The checked-out branch as a head ref.
    pub fn branch_ref(&self) -> Ref {
        Ref::head(&self.branch)
    }

    /// Opens the selected repository on the selected branch.
    pub fn open_repo(&self) -> RepoResult<Repo> {
        Repo::open(&self.repo_path()?, &self.user, Some(&self.branch))
    }

    /// Persists the repo/branch/user selection to the project dotfile.
    pub fn save_project(&self) -> RepoResult<()> {
        fs::create_dir_all(&self.project_dir)?;
        let project = ProjectConfig {
            repo: self.repo.clone(),
            branch: Some(self.branch.clone()),
            user: Some(self.user.clone()),
        };
        fs::write(
            self.project_dir.join("config"),
            serde_json::to_string_pretty(&project)?,
        )?;
        Ok(())
    }
}

fn read_project(project_dir: &Path) -> ProjectConfig {
    fs::read_to_string(project_dir.join("config"))
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default()
}

/// The `<user>@<host>` default identity.
fn default_user() -> String {
    let host = whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_owned());
    format!("{}@{host}", whoami::username())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let config = Config {
            config_dir: temp.path().join("cfg"),
            project_dir: temp.path().join("proj"),
            repo: Some("test".to_owned()),
            branch: "b0".to_owned(),
            user: "testy@test".to_owned(),
            repo_path_override: None,
        };
        config.save_project().unwrap();
        let project = read_project(&config.project_dir);
        assert_eq!(project.repo.as_deref(), Some("test"));
        assert_eq!(project.branch.as_deref(), Some("b0"));
        assert_eq!(project.user.as_deref(), Some("testy@test"));
    }

    #[test]
    fn test_repo_path_requires_selection() {
        let config = Config {
            config_dir: PathBuf::from("/tmp/cfg"),
            project_dir: PathBuf::from("/tmp/proj"),
            repo: None,
            branch: DEFAULT_BRANCH.to_owned(),
            user: "u@h".to_owned(),
            repo_path_override: None,
        };
        assert!(matches!(config.repo_path(), Err(RepoError::NoRepo)));
        assert_eq!(
            Config {
                repo: Some("r".to_owned()),
                ..config
            }
            .repo_path()
            .unwrap(),
            PathBuf::from("/tmp/cfg/repo/r")
        );
    }
}
