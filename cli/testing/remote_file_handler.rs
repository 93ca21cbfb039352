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

//! Remote protocol handler for `file://` URIs, useful for testing.
//!
//! Speaks the three-command handler protocol: `tag <uri>` prints the MD5
//! of the repository file (or the all-zeros tag when absent), `get <uri>
//! <tag>` prints its bytes, and `put <uri> <tag>` replaces them from
//! stdin. `get` and `put` fail when the tag no longer matches, which is
//! the compare-and-swap the engine relies on.

use std::io::Read as _;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use clap::Subcommand;
use dml_lib::hex_util;
use md5::Digest as _;
use md5::Md5;

const DEFAULT_TAG: &str = "00000000000000000000000000000000";

/// DaggerML remote file protocol handler.
#[derive(Parser)]
#[command(name = "dml-remote-file-handler")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the current content tag of the file at URI.
    Tag { uri: String },
    /// Print the contents of the file at URI, failing if the tag
    /// changed.
    Get { uri: String, tag: String },
    /// Replace the file at URI from stdin, failing if the tag changed.
    Put { uri: String, tag: String },
}

fn file_path(uri: &str) -> PathBuf {
    let Some(path) = uri.strip_prefix("file://") else {
        eprintln!("invalid URI scheme: {uri}");
        exit(1);
    };
    PathBuf::from(path).join("data.redb")
}

fn current_tag(path: &PathBuf) -> String {
    match std::fs::read(path) {
        Ok(bytes) => hex_util::encode_hex(&Md5::digest(&bytes)),
        Err(_) => DEFAULT_TAG.to_owned(),
    }
}

fn check_tag(path: &PathBuf, tag: &str) {
    let current = current_tag(path);
    if current != tag {
        eprintln!("contents changed: please try again");
        exit(1);
    }
}

fn main() {
    match Args::parse().command {
        Command::Tag { uri } => {
            print!("{}", current_tag(&file_path(&uri)));
        }
        Command::Get { uri, tag } => {
            let path = file_path(&uri);
            check_tag(&path, &tag);
            let bytes = std::fs::read(&path).unwrap_or_else(|err| {
                eprintln!("cannot read {}: {err}", path.display());
                exit(1);
            });
            std::io::stdout().write_all(&bytes).unwrap();
        }
        Command::Put { uri, tag } => {
            let path = file_path(&uri);
            check_tag(&path, &tag);
            let mut bytes = vec![];
            std::io::stdin().read_to_end(&mut bytes).unwrap();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&path, bytes).unwrap();
        }
    }
}
