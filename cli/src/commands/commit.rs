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

use super::print_json;

/// Inspect commit history.
#[derive(Args)]
pub struct CommitArgs {
    #[command(subcommand)]
    command: CommitCommand,
}

#[derive(Subcommand)]
enum CommitCommand {
    /// Print the current branch's history.
    Log,
    /// Revert a commit.
    Revert { commit: String },
}

pub fn run(config: &Config, args: CommitArgs) -> RepoResult<()> {
    match args.command {
        CommitCommand::Log => print_json(&api::commit_log(config)?),
        CommitCommand::Revert { commit } => api::revert_commit(config, &commit),
    }
}
