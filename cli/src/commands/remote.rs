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

use clap::Args;
use clap::Subcommand;
use dml_lib::api;
use dml_lib::config::Config;
use dml_lib::repo::RepoResult;
use serde_json::json;

use super::print_json;

/// Synchronize with remote repositories.
#[derive(Args)]
pub struct RemoteArgs {
    #[command(subcommand)]
    command: RemoteCommand,
}

#[derive(Subcommand)]
enum RemoteCommand {
    /// Register a remote URI.
    Create { name: String, uri: String },
    /// Forget a remote.
    Delete { name: String },
    /// List remotes.
    List,
    /// Clone a remote repository under a local name.
    Clone { name: String, repo: String },
    /// Fetch remote branches under `<remote>/<branch>` names.
    Fetch { name: String },
    /// Fetch, then merge the remote's copy of the current branch.
    Pull { name: String },
    /// Merge the current branch into the remote and upload it.
    Push { name: String },
}

pub fn run(config: &Config, args: RemoteArgs) -> RepoResult<()> {
    match args.command {
        RemoteCommand::Create { name, uri } => api::create_remote(config, &name, &uri),
        RemoteCommand::Delete { name } => api::delete_remote(config, &name),
        RemoteCommand::List => {
            let remotes = api::list_remotes(config)?
                .into_iter()
                .map(|remote| {
                    json!({
                        "name": remote.name,
                        "uri": remote.uri,
                        "path": remote.path.to_string_lossy(),
                    })
                })
                .collect();
            print_json(&serde_json::Value::Array(remotes))
        }
        RemoteCommand::Clone { name, repo } => {
            api::clone_remote(config, &name, &repo)?;
            Ok(())
        }
        RemoteCommand::Fetch { name } => api::fetch_remote(config, &name),
        RemoteCommand::Pull { name } => {
            api::pull_remote(config, &name)?;
            Ok(())
        }
        RemoteCommand::Push { name } => api::push_remote(config, &name),
    }
}
