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

//! The compile engine: the deterministic projection of a head into the
//! ordered message sequence a model consumes.
//!
//! Compilation walks the first-parent chain, expands merge side-branches as
//! bounded blocks, resolves EDIT overrides, applies the priority overlay,
//! and renders each surviving commit through the injected compiler
//! capability. It never mutates the DAG; the only write is the optional
//! compile record.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

use serde::Serialize;

use crate::annotate::Priority;
use crate::commit::CommitOp;
use crate::content::DialogueRole;
use crate::content::Payload;
use crate::dag_walk;
use crate::object_id::CommitId;
use crate::object_id::ContentId;
use crate::object_id::TractId;
use crate::op_store::RecordId;
use crate::store::Store;
use crate::store::StoreResult;
use crate::tokenize::Tokenizer;

/// Output message role in the model's chat shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl From<DialogueRole> for MessageRole {
    fn from(role: DialogueRole) -> Self {
        match role {
            DialogueRole::System => Self::System,
            DialogueRole::User => Self::User,
            DialogueRole::Assistant => Self::Assistant,
        }
    }
}

/// One message of a compiled context, traceable to the commit it came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    pub source_commit: CommitId,
    pub tokens: u64,
}

/// A commit as the compiler sees it: content after EDIT override, with its
/// resolved priority.
#[derive(Clone, Debug, PartialEq)]
pub struct EffectiveCommit {
    pub id: CommitId,
    pub payload: Payload,
    pub priority: Priority,
    /// Whether an EDIT override replaced the original content.
    pub edited: bool,
}

/// The exact prompt a model will see, deterministic modulo its inputs.
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledContext {
    pub messages: Vec<Message>,
    pub token_count: u64,
    pub head: Option<CommitId>,
    pub branch: Option<String>,
    /// Set when a recording caller compiled this context.
    pub record: Option<RecordId>,
    /// The ordered surviving commits with resolved priorities, markers
    /// included.
    pub effective: Vec<(CommitId, Priority)>,
}

impl CompiledContext {
    pub fn empty(branch: Option<String>) -> Self {
        Self {
            messages: Vec::new(),
            token_count: 0,
            head: None,
            branch,
            record: None,
            effective: Vec::new(),
        }
    }

    /// The messages joined into one plain-text transcript.
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// The compiler capability: maps one effective commit to zero or more
/// `(role, content)` pairs. Must be deterministic for identical inputs.
pub trait ContextCompiler: Debug {
    /// Identifies the rendering, as part of the compile cache fingerprint.
    fn name(&self) -> &str;

    fn render(&self, commit: &EffectiveCommit) -> Vec<(MessageRole, String)>;
}

/// The default role-ordered concatenation compiler.
#[derive(Debug)]
pub struct RoleCompiler;

impl ContextCompiler for RoleCompiler {
    fn name(&self) -> &str {
        "role-concat"
    }

    fn render(&self, commit: &EffectiveCommit) -> Vec<(MessageRole, String)> {
        match &commit.payload {
            Payload::Dialogue { role, text } => vec![((*role).into(), text.clone())],
            Payload::Instruction { text } => vec![(MessageRole::System, text.clone())],
            Payload::ToolCall { .. } | Payload::ToolResult { .. } => {
                vec![(MessageRole::Tool, commit.payload.prompt_text())]
            }
            // Markers render to no messages but stay in provenance.
            Payload::Session { .. } | Payload::Spawn { .. } => vec![],
            Payload::Opaque { text } => vec![(MessageRole::System, text.clone())],
        }
    }
}

/// Cache key for compiled contexts. Ref updates and annotation mutations
/// change a component of the key, so stale entries miss instead of being
/// invalidated in place; unrelated heads survive.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CompileCacheKey {
    pub tract: TractId,
    pub head: Option<CommitId>,
    pub annotation_fingerprint: String,
    pub compiler_fingerprint: String,
}

/// Collects the compile chain for `head` in chronological order (root first).
/// Merge commits pull the ancestry of each non-first parent, back to the
/// merge base, in as a bounded block immediately before the merge commit.
pub fn collect_chain(store: &Arc<Store>, head: &CommitId) -> StoreResult<Vec<CommitId>> {
    let mut mainline = dag_walk::first_parent_chain(store, head)?;
    mainline.reverse();
    let mut seen: HashSet<CommitId> = mainline.iter().cloned().collect();
    let mut chain = Vec::with_capacity(mainline.len());
    for id in mainline {
        let commit = store.get_commit(&id)?;
        if let [mainline_parent, side_parents @ ..] = commit.parent_ids()
            && !side_parents.is_empty()
        {
            for side in side_parents {
                let base = dag_walk::merge_base(store, side, mainline_parent)?;
                let mut block = Vec::new();
                for ancestor in dag_walk::first_parent_chain(store, side)? {
                    if Some(&ancestor) == base.as_ref() {
                        break;
                    }
                    block.push(ancestor);
                }
                block.reverse();
                for expanded in block {
                    if seen.insert(expanded.clone()) {
                        chain.push(expanded);
                    }
                }
            }
        }
        chain.push(id);
    }
    Ok(chain)
}

/// The most recent EDIT per target across the chain. EDIT commits are
/// suppressed from output; their content surfaces at the target's position.
fn build_edit_map(
    store: &Arc<Store>,
    chain: &[CommitId],
) -> StoreResult<HashMap<CommitId, ContentId>> {
    let mut edit_map = HashMap::new();
    for id in chain {
        let commit = store.get_commit(id)?;
        if commit.op() == CommitOp::Edit
            && let Some(target) = commit.edit_target()
        {
            edit_map.insert(target.clone(), commit.content_id().clone());
        }
    }
    Ok(edit_map)
}

/// Compiles `head` into a message sequence. Passing `triggered_by` persists
/// a compile record in the same store session; compile itself never mutates
/// the DAG or refs.
pub fn compile(
    store: &Arc<Store>,
    tract: &TractId,
    head: Option<&CommitId>,
    branch: Option<&str>,
    compiler: &dyn ContextCompiler,
    tokenizer: &dyn Tokenizer,
    triggered_by: Option<&str>,
) -> StoreResult<CompiledContext> {
    let Some(head) = head else {
        return Ok(CompiledContext::empty(branch.map(str::to_owned)));
    };

    let chain = collect_chain(store, head)?;
    let edit_map = build_edit_map(store, &chain)?;
    let annotations = store.effective_annotations(tract)?;

    let mut messages = Vec::new();
    let mut effective = Vec::new();
    for id in &chain {
        let commit = store.get_commit(id)?;
        if commit.op() == CommitOp::Edit {
            continue;
        }
        let priority = annotations.get(id).copied().unwrap_or_default();
        if priority == Priority::Skip {
            continue;
        }
        let content_id = edit_map.get(id).unwrap_or_else(|| commit.content_id());
        let payload = store.get_blob(content_id)?;
        let effective_commit = EffectiveCommit {
            id: id.clone(),
            payload,
            priority,
            edited: edit_map.contains_key(id),
        };
        for (role, content) in compiler.render(&effective_commit) {
            let tokens = tokenizer.count(&content);
            messages.push(Message {
                role,
                content,
                source_commit: id.clone(),
                tokens,
            });
        }
        effective.push((id.clone(), priority));
    }

    let token_count = messages.iter().map(|m| m.tokens).sum();
    let record = triggered_by
        .map(|trigger| {
            store.record_compile(tract, head, branch, token_count, Some(trigger), &effective)
        })
        .transpose()?;

    Ok(CompiledContext {
        messages,
        token_count,
        head: Some(head.clone()),
        branch: branch.map(str::to_owned),
        record,
        effective,
    })
}
