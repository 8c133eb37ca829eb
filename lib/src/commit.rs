// Copyright 2024 The Tract Authors
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

#![expect(missing_docs)]

use std::cmp::Ordering;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest as _;
use sha2::Sha256;

use crate::config::LlmConfig;
use crate::content::Payload;
use crate::object_id::CommitId;
use crate::object_id::ContentId;
use crate::object_id::TractId;
use crate::store::Store;
use crate::store::StoreResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MillisSinceEpoch(pub i64);

impl MillisSinceEpoch {
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_millis())
    }
}

/// The two commit operations. An EDIT commit replaces the effective content
/// of a prior commit at compile time; an APPEND commit extends the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOp {
    Append,
    Edit,
}

impl CommitOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::Edit => "edit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "append" => Some(Self::Append),
            "edit" => Some(Self::Edit),
            _ => None,
        }
    }
}

/// Token usage reported by a model provider for one generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// The immutable record behind a commit. The commit id is the SHA-256 over
/// `[content | parents | op | edit_target | timestamp | tract]`; message,
/// generation config, and usage are carried alongside but do not participate
/// in the hash.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CommitData {
    pub tract: TractId,
    pub content: ContentId,
    pub parents: Vec<CommitId>,
    pub op: CommitOp,
    pub edit_target: Option<CommitId>,
    pub token_count: u64,
    pub timestamp: MillisSinceEpoch,
    pub message: Option<String>,
    pub generation_config: Option<LlmConfig>,
    pub usage: Option<GenerationUsage>,
}

impl CommitData {
    pub fn id(&self) -> CommitId {
        use crate::object_id::ObjectId as _;
        let mut hasher = Sha256::new();
        hasher.update(self.content.as_bytes());
        hasher.update((self.parents.len() as u64).to_be_bytes());
        for parent in &self.parents {
            hasher.update(parent.as_bytes());
        }
        hasher.update([match self.op {
            CommitOp::Append => 0u8,
            CommitOp::Edit => 1u8,
        }]);
        match &self.edit_target {
            Some(target) => {
                hasher.update([1u8]);
                hasher.update(target.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        hasher.update(self.timestamp.0.to_be_bytes());
        hasher.update(self.tract.as_bytes());
        CommitId::new(hasher.finalize().to_vec())
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }
}

/// A commit handle backed by the store.
#[derive(Clone)]
pub struct Commit {
    store: Arc<Store>,
    id: CommitId,
    data: Arc<CommitData>,
}

impl Debug for Commit {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("Commit").field("id", &self.id).finish()
    }
}

impl PartialEq for Commit {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Commit {}

impl Ord for Commit {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl PartialOrd for Commit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for Commit {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Commit {
    pub fn new(store: Arc<Store>, id: CommitId, data: Arc<CommitData>) -> Self {
        Self { store, id, data }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn id(&self) -> &CommitId {
        &self.id
    }

    pub fn tract(&self) -> &TractId {
        &self.data.tract
    }

    pub fn content_id(&self) -> &ContentId {
        &self.data.content
    }

    pub fn parent_ids(&self) -> &[CommitId] {
        &self.data.parents
    }

    pub fn parents(&self) -> impl Iterator<Item = StoreResult<Self>> {
        self.data.parents.iter().map(|id| self.store.get_commit(id))
    }

    pub fn first_parent_id(&self) -> Option<&CommitId> {
        self.data.parents.first()
    }

    pub fn op(&self) -> CommitOp {
        self.data.op
    }

    pub fn edit_target(&self) -> Option<&CommitId> {
        self.data.edit_target.as_ref()
    }

    pub fn token_count(&self) -> u64 {
        self.data.token_count
    }

    pub fn timestamp(&self) -> MillisSinceEpoch {
        self.data.timestamp
    }

    pub fn message(&self) -> Option<&str> {
        self.data.message.as_deref()
    }

    pub fn generation_config(&self) -> Option<&LlmConfig> {
        self.data.generation_config.as_ref()
    }

    pub fn usage(&self) -> Option<&GenerationUsage> {
        self.data.usage.as_ref()
    }

    pub fn is_merge(&self) -> bool {
        self.data.is_merge()
    }

    /// Reads the content payload from the blob table.
    pub fn payload(&self) -> StoreResult<Payload> {
        self.store.get_blob(&self.data.content)
    }

    pub fn data(&self) -> &Arc<CommitData> {
        &self.data
    }
}

pub trait CommitIteratorExt<'c, I> {
    fn ids(self) -> impl Iterator<Item = &'c CommitId>;
}

impl<'c, I> CommitIteratorExt<'c, I> for I
where
    I: Iterator<Item = &'c Commit>,
{
    fn ids(self) -> impl Iterator<Item = &'c CommitId> {
        self.map(|commit| commit.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::DialogueRole;

    fn sample_data() -> CommitData {
        let payload = Payload::dialogue(DialogueRole::User, "hello");
        CommitData {
            tract: TractId::from_hex("000102030405060708090a0b0c0d0e0f"),
            content: payload.content_id().unwrap(),
            parents: vec![],
            op: CommitOp::Append,
            edit_target: None,
            token_count: 1,
            timestamp: MillisSinceEpoch(1_700_000_000_000),
            message: Some("hello".to_string()),
            generation_config: None,
            usage: None,
        }
    }

    #[test]
    fn test_commit_id_deterministic() {
        assert_eq!(sample_data().id(), sample_data().id());
    }

    #[test]
    fn test_commit_id_depends_on_hashed_fields() {
        let base = sample_data();
        let base_id = base.id();

        let mut changed = base.clone();
        changed.timestamp = MillisSinceEpoch(base.timestamp.0 + 1);
        assert_ne!(changed.id(), base_id);

        let mut changed = base.clone();
        changed.tract = TractId::from_hex("0f0e0d0c0b0a09080706050403020100");
        assert_ne!(changed.id(), base_id);

        let mut changed = base.clone();
        changed.op = CommitOp::Edit;
        changed.edit_target = Some(base_id.clone());
        assert_ne!(changed.id(), base_id);

        // The message is carried but not hashed.
        let mut changed = base.clone();
        changed.message = Some("different".to_string());
        assert_eq!(changed.id(), base_id);
    }
}
