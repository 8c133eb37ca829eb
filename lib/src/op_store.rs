// Copyright 2025 The Tract Authors
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

//! Provenance records: operation events, compile records, spawn pointers.
//!
//! The event table is append-only. Structural operations write their event in
//! the same transaction as the mutation itself, so an event either describes
//! a change that happened or does not exist.

#![expect(missing_docs)]

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::annotate::Priority;
use crate::commit::MillisSinceEpoch;
use crate::object_id::CommitId;
use crate::object_id::TractId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of structural transformations that record an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Compress,
    Reorganize,
    Import,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compress => "compress",
            Self::Reorganize => "reorganize",
            Self::Import => "import",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "compress" => Some(Self::Compress),
            "reorganize" => Some(Self::Reorganize),
            "import" => Some(Self::Import),
            _ => None,
        }
    }
}

/// Role of a commit within an operation event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventCommitRole {
    /// Consumed by the event (e.g. summarized away).
    Source,
    /// Produced by the event.
    Result,
    /// Carried through untouched (pinned commits under compression).
    Preserved,
}

impl EventCommitRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Result => "result",
            Self::Preserved => "preserved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "source" => Some(Self::Source),
            "result" => Some(Self::Result),
            "preserved" => Some(Self::Preserved),
            _ => None,
        }
    }
}

/// A fully loaded operation event. Commit lists preserve insertion order, so
/// positional source→result maps (rebase) read back in the order they were
/// recorded.
#[derive(Clone, Debug, PartialEq)]
pub struct OperationEvent {
    pub id: EventId,
    pub tract: TractId,
    pub kind: EventKind,
    pub params: serde_json::Value,
    pub original_tokens: u64,
    pub compressed_tokens: u64,
    pub created_at: MillisSinceEpoch,
    pub sources: Vec<CommitId>,
    pub results: Vec<CommitId>,
    pub preserved: Vec<CommitId>,
}

/// A persisted snapshot of one compile that was sent to a model: the head it
/// was compiled from and the exact ordered commits with their resolved
/// priorities.
#[derive(Clone, Debug, PartialEq)]
pub struct CompileRecord {
    pub id: RecordId,
    pub tract: TractId,
    pub head: CommitId,
    pub branch: Option<String>,
    pub token_count: u64,
    pub created_at: MillisSinceEpoch,
    pub triggered_by: Option<String>,
    /// `(position, commit, effective priority)` in compile order.
    pub effective: Vec<(CommitId, Priority)>,
}

/// How a spawned child tract inherits from its parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InheritanceMode {
    FullClone,
    HeadSnapshot,
    Branch,
}

impl InheritanceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FullClone => "full_clone",
            Self::HeadSnapshot => "head_snapshot",
            Self::Branch => "branch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full_clone" => Some(Self::FullClone),
            "head_snapshot" => Some(Self::HeadSnapshot),
            "branch" => Some(Self::Branch),
            _ => None,
        }
    }
}

/// A parent→child link in the spawn graph.
#[derive(Clone, Debug, PartialEq)]
pub struct SpawnPointer {
    pub id: i64,
    pub parent_tract: TractId,
    pub parent_commit: Option<CommitId>,
    pub child_tract: TractId,
    pub mode: InheritanceMode,
    pub purpose: String,
    pub created_at: MillisSinceEpoch,
}
