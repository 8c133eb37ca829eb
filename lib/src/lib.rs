// Copyright 2024-2025 The Tract Authors
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

//! Tract is a version-control engine for the token contexts language-model
//! agents consume. A context is an ordered log of immutable commits in a
//! DAG with named branches and a current head; structural operations
//! (commit, branch, merge, rebase, import, compress, spawn/collapse, GC)
//! preserve full provenance, and the compile engine deterministically
//! projects a head into the exact message sequence a model sees.

pub mod annotate;
pub mod commit;
pub mod compile;
pub mod compress;
pub mod config;
pub mod content;
pub mod dag_walk;
pub mod gc;
pub mod hex_util;
pub mod hooks;
pub mod llm;
pub mod merge;
pub mod object_id;
pub mod op_store;
pub mod rewrite;
pub mod spawn;
pub mod store;
pub mod tokenize;
pub mod tract;
pub mod workspace;
