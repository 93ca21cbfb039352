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

mod branch;
mod commit;
mod config;
mod dag;
mod remote;
mod repo;
mod status;

use clap::Parser;
use clap::Subcommand;
use dml_lib::config::Config;
use dml_lib::repo::RepoResult;

/// DaggerML: a content-addressed store for computation graphs.
#[derive(Parser)]
#[command(name = "dml", version)]
pub struct Cli {
    /// Print the full error chain on failure.
    #[arg(long, global = true)]
    pub debug: bool,
    /// Repository to operate on, overriding the configured one.
    #[arg(long, global = true)]
    pub repo: Option<String>,
    /// Branch to operate on, overriding the configured one.
    #[arg(long, global = true)]
    pub branch: Option<String>,
    /// User identity, overriding the configured one.
    #[arg(long, global = true)]
    pub user: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Repo(repo::RepoArgs),
    Branch(branch::BranchArgs),
    Dag(dag::DagArgs),
    Commit(commit::CommitArgs),
    Remote(remote::RemoteArgs),
    Config(config::ConfigArgs),
    Status(status::StatusArgs),
}

pub fn run(cli: Cli) -> RepoResult<()> {
    let mut config = Config::from_env();
    if let Some(repo) = cli.repo {
        config.repo = Some(repo);
    }
    if let Some(branch) = cli.branch {
        config.branch = branch;
    }
    if let Some(user) = cli.user {
        config.user = user;
    }
    match cli.command {
        Command::Repo(args) => repo::run(&mut config, args),
        Command::Branch(args) => branch::run(&mut config, args),
        Command::Dag(args) => dag::run(&config, args),
        Command::Commit(args) => commit::run(&config, args),
        Command::Remote(args) => remote::run(&config, args),
        Command::Config(args) => config::run(&mut config, args),
        Command::Status(args) => status::run(&config, args),
    }
}

/// Prints a JSON value the way every listing subcommand does.
pub(crate) fn print_json(value: &serde_json::Value) -> RepoResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
