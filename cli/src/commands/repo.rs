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

/// Manage repositories.
#[derive(Args)]
pub struct RepoArgs {
    #[command(subcommand)]
    command: RepoCommand,
}

#[derive(Subcommand)]
enum RepoCommand {
    /// Create a repository and select it.
    Create { name: String },
    /// Delete a repository.
    Delete { name: String },
    /// Copy the selected repository under a new name.
    Copy { name: String },
    /// List repositories.
    List,
    /// Delete unreachable objects from the selected repository.
    Gc,
    /// Print the selected repository's path.
    Path,
}

pub fn run(config: &mut Config, args: RepoArgs) -> RepoResult<()> {
    match args.command {
        RepoCommand::Create { name } => {
            api::create_repo(config, &name)?;
            api::config_repo(config, &name)
        }
        RepoCommand::Delete { name } => api::delete_repo(config, &name),
        RepoCommand::Copy { name } => api::copy_repo(config, &name),
        RepoCommand::List => {
            let repos = api::list_repos(config)?
                .into_iter()
                .map(|(name, path)| json!({"name": name, "path": path.to_string_lossy()}))
                .collect();
            print_json(&serde_json::Value::Array(repos))
        }
        RepoCommand::Gc => {
            let stats = api::gc_repo(config)?;
            print_json(&json!({
                "deleted": stats.deleted,
                "resources": stats
                    .resources
                    .iter()
                    .map(|resource| resource.uri.clone())
                    .collect::<Vec<_>>(),
            }))
        }
        RepoCommand::Path => {
            println!("{}", api::repo_path(config)?.display());
            Ok(())
        }
    }
}
