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

/// Persist repo/branch/user selections in the project config.
#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Select the repository.
    Repo { name: String },
    /// Select the branch.
    Branch { name: String },
    /// Set the user identity.
    User { user: String },
}

pub fn run(config: &mut Config, args: ConfigArgs) -> RepoResult<()> {
    match args.command {
        ConfigCommand::Repo { name } => api::config_repo(config, &name),
        ConfigCommand::Branch { name } => api::config_branch(config, &name),
        ConfigCommand::User { user } => api::config_user(config, &user),
    }
}
