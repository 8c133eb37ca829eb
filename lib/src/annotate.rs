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

//! The priority overlay on commits. Annotations are mutable metadata with an
//! append-only history; commits themselves never change.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest as _;
use sha2::Sha256;

use crate::commit::MillisSinceEpoch;
use crate::object_id::CommitId;
use crate::object_id::ObjectId as _;

/// Compile-time priority of a commit. PINNED content is inviolable to
/// compression and never dropped by the compile filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Skip,
    #[default]
    Normal,
    Pinned,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Normal => "normal",
            Self::Pinned => "pinned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "skip" => Some(Self::Skip),
            "normal" => Some(Self::Normal),
            "pinned" => Some(Self::Pinned),
            _ => None,
        }
    }
}

/// One entry in a commit's annotation history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Annotation {
    pub target: CommitId,
    pub priority: Priority,
    pub reason: Option<String>,
    pub created_at: MillisSinceEpoch,
}

/// A digest over the current effective priorities of a tract, used to key the
/// compile cache. Any annotation mutation changes the fingerprint, so stale
/// cache entries miss instead of being served.
pub fn annotation_fingerprint(effective: &BTreeMap<CommitId, Priority>) -> String {
    let mut hasher = Sha256::new();
    for (target, priority) in effective {
        hasher.update(target.as_bytes());
        hasher.update([*priority as u8]);
    }
    crate::hex_util::encode_hex(&hasher.finalize())
}
