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

/// Manage branches. With no subcommand, prints the current branch.
#[derive(Args)]
pub struct BranchArgs {
    #[command(subcommand)]
    command: Option<BranchCommand>,
}

#[derive(Subcommand)]
enum BranchCommand {
    /// Create a branch (from the current head, or a commit id) and
    /// switch to it.
    Create {
        name: String,
        /// Commit id to branch from.
        #[arg(long)]
        commit: Option<String>,
    },
    /// Delete a branch.
    Delete { name: String },
    /// List branches.
    List,
    /// Switch to a branch.
    Use { name: String },
    /// Merge another branch into the current one.
    Merge { name: String },
    /// Rebase the current branch onto another.
    Rebase { name: String },
}

pub fn run(config: &mut Config, args: BranchArgs) -> RepoResult<()> {
    match args.command {
        None => {
            println!("{}", api::current_branch(config));
            Ok(())
        }
        Some(BranchCommand::Create { name, commit }) => {
            api::create_branch(config, &name, commit.as_deref())
        }
        Some(BranchCommand::Delete { name }) => api::delete_branch(config, &name),
        Some(BranchCommand::List) => {
            for branch in api::list_branches(config)? {
                println!("{branch}");
            }
            Ok(())
        }
        Some(BranchCommand::Use { name }) => api::use_branch(config, &name),
        Some(BranchCommand::Merge { name }) => {
            println!("{}", api::merge_branch(config, &name)?);
            Ok(())
        }
        Some(BranchCommand::Rebase { name }) => {
            println!("{}", api::rebase_branch(config, &name)?);
            Ok(())
        }
    }
}
