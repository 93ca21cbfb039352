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

/// Build and inspect dags.
#[derive(Args)]
pub struct DagArgs {
    #[command(subcommand)]
    command: DagCommand,
}

#[derive(Subcommand)]
enum DagCommand {
    /// Start building a dag; prints the builder token.
    Create {
        name: String,
        message: String,
        /// Adopt a dag from a dump instead of starting empty.
        #[arg(long)]
        dump: Option<String>,
    },
    /// Dispatch a builder op: `[op, args, kwargs]` JSON against a token.
    Invoke { token: String, payload: String },
    /// Commit the removal of a dag.
    Delete { name: String, message: String },
    /// List dags on the current branch.
    List,
    /// Print a dag's topology.
    Describe { dag: String },
}

pub fn run(config: &Config, args: DagArgs) -> RepoResult<()> {
    match args.command {
        DagCommand::Create {
            name,
            message,
            dump,
        } => {
            let token = api::begin_dag(config, &name, &message, dump.as_deref())?;
            print_json(&json!(token))
        }
        DagCommand::Invoke { token, payload } => {
            let payload: serde_json::Value = serde_json::from_str(&payload)?;
            print_json(&api::invoke(config, &token, &payload)?)
        }
        DagCommand::Delete { name, message } => {
            println!("{}", api::delete_dag(config, &name, &message)?);
            Ok(())
        }
        DagCommand::List => print_json(&api::list_dags(config)?),
        DagCommand::Describe { dag } => print_json(&api::describe_dag(config, &dag)?),
    }
}
