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

//! Library for DaggerML: a content-addressed, versioned object store and
//! execution ledger for computation graphs.
//!
//! Users build named dags of typed nodes and commit them to branches that
//! evolve with Git-like semantics. Function nodes are either evaluated
//! in-process or handed to external adapters, deduplicated globally
//! through content-keyed fndags.

pub mod api;
pub mod cache;
pub mod config;
pub mod dag_builder;
pub mod dispatch;
pub mod hex_util;
pub mod kv;
pub mod merge;
pub mod model;
pub mod object_id;
pub mod pack;
pub mod remote;
pub mod repo;
pub mod store;
pub mod wire;
