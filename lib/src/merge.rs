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

//! Merging one branch into the current one. Fast-forward when the heads are
//! related; otherwise a two-parent merge commit, textual or LLM-mediated.

use itertools::Itertools as _;
use tracing::instrument;

use crate::commit::Commit;
use crate::commit::CommitOp;
use crate::compile::Message;
use crate::compile::MessageRole;
use crate::config::LlmConfig;
use crate::content::Payload;
use crate::dag_walk;
use crate::hooks::HookOutcome;
use crate::llm::LlmError;
use crate::llm::chat_with_retry;
use crate::object_id::CommitId;
use crate::tract::Tract;
use crate::tract::TractError;
use crate::tract::TractResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Concatenate the source side's diverged content into the merge commit.
    Textual,
    /// Delegate overlapping content to the model resolver.
    Semantic,
}

#[derive(Clone, Debug, PartialEq)]
pub enum MergeOutcome {
    /// The source is already an ancestor of the target; nothing moved.
    AlreadyUpToDate,
    /// The target was an ancestor of the source; the ref advanced, no merge
    /// commit was created.
    FastForward(CommitId),
    /// A two-parent merge commit (target first, source second).
    Merged(Commit),
}

const SEMANTIC_MERGE_PROMPT: &str = "Two context branches disagree on overlapping content. \
     Produce a single consolidated version that keeps every fact both sides agree on and \
     resolves the disagreement. Reply with the consolidated content only.";

#[instrument(skip(tract, config))]
pub(crate) fn merge(
    tract: &Tract,
    source_ref: &str,
    strategy: MergeStrategy,
    config: Option<&LlmConfig>,
) -> TractResult<MergeOutcome> {
    let store = tract.store();
    let branch = tract.current_branch()?;
    let source = store
        .branch_target(tract.id(), source_ref)?
        .ok_or_else(|| TractError::UnknownBranch(source_ref.to_string()))?;

    let Some(target) = store.branch_target(tract.id(), &branch)? else {
        // An unborn branch fast-forwards to the source head.
        store.set_branch(tract.id(), &branch, &source)?;
        return Ok(MergeOutcome::FastForward(source));
    };

    if dag_walk::has_ancestor(store, &target, &source)? {
        return Ok(MergeOutcome::AlreadyUpToDate);
    }
    if dag_walk::has_ancestor(store, &source, &target)? {
        store.set_branch(tract.id(), &branch, &source)?;
        return Ok(MergeOutcome::FastForward(source));
    }

    let source_base = dag_walk::merge_base(store, &source, &target)?;
    let target_base = dag_walk::merge_base(store, &target, &source)?;
    let diverged_source = diverged_since(tract, source_base.as_ref(), &source)?;
    let diverged_target = diverged_since(tract, target_base.as_ref(), &target)?;

    let default_message = format!("merge {source_ref} into {branch}");
    let plan = serde_json::json!({
        "source": source_ref,
        "strategy": match strategy {
            MergeStrategy::Textual => "textual",
            MergeStrategy::Semantic => "semantic",
        },
        "message": default_message,
    });
    let message = match tract.hooks().fire("merge", plan) {
        HookOutcome::Rejected { reason } => {
            return Err(TractError::HookRejected {
                operation: "merge",
                reason,
            });
        }
        HookOutcome::Approved { plan } => plan
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_owned)
            .unwrap_or(default_message),
    };

    // The resolver runs before the write transaction opens; no lock is held
    // across the model call.
    let content = match strategy {
        MergeStrategy::Textual => textual_content(&diverged_source),
        MergeStrategy::Semantic => {
            semantic_content(tract, &diverged_target, &diverged_source, config)?
        }
    };

    store.in_savepoint(|| {
        let commit = tract.write_payload_commit(
            Payload::opaque(content.clone()),
            vec![target.clone(), source.clone()],
            CommitOp::Append,
            None,
            Some(message.clone()),
            None,
            None,
            None,
        )?;
        store.set_branch(tract.id(), &branch, commit.id())?;
        Ok(MergeOutcome::Merged(commit))
    })
}

/// `(commit, payload text)` for the first-parent path since the merge base,
/// chronological, markers and empty renderings dropped.
fn diverged_since(
    tract: &Tract,
    base: Option<&CommitId>,
    head: &CommitId,
) -> TractResult<Vec<(Commit, String)>> {
    let store = tract.store();
    let path = match base {
        Some(base) => dag_walk::between(store, base, head)?.unwrap_or_default(),
        None => {
            let mut chain = dag_walk::first_parent_chain(store, head)?;
            chain.reverse();
            chain
        }
    };
    let mut out = Vec::new();
    for id in path {
        let commit = store.get_commit(&id)?;
        let text = commit.payload()?.prompt_text();
        if !text.is_empty() {
            out.push((commit, text));
        }
    }
    Ok(out)
}

/// The canonical concatenation of the source side's diverged content.
fn textual_content(diverged_source: &[(Commit, String)]) -> String {
    diverged_source.iter().map(|(_, text)| text.as_str()).join("\n\n")
}

/// Overlap key: two commits conflict when their rendered outputs land in the
/// same role/topic bucket.
fn conflict_key(payload: &Payload) -> Option<String> {
    match payload {
        Payload::Dialogue { role, .. } => Some(format!("dialogue/{}", role.as_str())),
        Payload::Instruction { .. } => Some("instruction".to_string()),
        Payload::ToolCall { .. } | Payload::ToolResult { .. } => Some("tool".to_string()),
        Payload::Session { .. } | Payload::Spawn { .. } => None,
        Payload::Opaque { .. } => Some("opaque".to_string()),
    }
}

fn semantic_content(
    tract: &Tract,
    diverged_target: &[(Commit, String)],
    diverged_source: &[(Commit, String)],
    config: Option<&LlmConfig>,
) -> TractResult<String> {
    let configs = tract.configs();
    let effective = configs.resolve(&configs.merge, config);

    let mut target_by_key: Vec<(String, Vec<&str>)> = Vec::new();
    for (commit, text) in diverged_target {
        if let Some(key) = commit.payload().ok().as_ref().and_then(conflict_key) {
            match target_by_key.iter_mut().find(|(k, _)| *k == key) {
                Some((_, texts)) => texts.push(text),
                None => target_by_key.push((key, vec![text])),
            }
        }
    }

    let mut resolutions = Vec::new();
    let mut unconflicted = Vec::new();
    for (commit, text) in diverged_source {
        let payload = commit.payload()?;
        let Some(key) = conflict_key(&payload) else {
            continue;
        };
        let Some((_, target_texts)) = target_by_key.iter().find(|(k, _)| *k == key) else {
            unconflicted.push(text.as_str());
            continue;
        };
        let prompt = format!(
            "Current branch says:\n{}\n\nIncoming branch says:\n{}",
            target_texts.iter().join("\n"),
            text
        );
        let messages = vec![
            Message {
                role: MessageRole::System,
                content: SEMANTIC_MERGE_PROMPT.to_string(),
                source_commit: commit.id().clone(),
                tokens: 0,
            },
            Message {
                role: MessageRole::User,
                content: prompt,
                source_commit: commit.id().clone(),
                tokens: 0,
            },
        ];
        let response =
            match chat_with_retry(tract.llm().as_ref(), &messages, &effective, tract.retry_policy())
            {
                Ok(response) => response,
                Err(LlmError::Rejected { message }) => {
                    return Err(TractError::MergeConflict { reason: message });
                }
                Err(err) => return Err(err.into()),
            };
        if response.text.trim().is_empty() {
            return Err(TractError::MergeConflict {
                reason: "resolver returned no resolution".to_string(),
            });
        }
        resolutions.push(response.text);
    }

    Ok(resolutions
        .iter()
        .map(String::as_str)
        .chain(unconflicted)
        .join("\n\n"))
}
