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

//! Lossy, provenance-recording compression. The model summarizes NORMAL
//! content; PINNED content survives verbatim at its original ordinal. The
//! compress event keeps every source commit protected from GC.
//!
//! The operation is split into a plan phase (model calls, no transaction)
//! and an apply phase (one savepoint). Collaborative mode stops after the
//! plan and returns the drafts for the caller to edit and approve.

use tracing::instrument;
use tracing::warn;

use crate::annotate::Priority;
use crate::commit::CommitOp;
use crate::compile;
use crate::compile::Message;
use crate::compile::MessageRole;
use crate::config::LlmConfig;
use crate::content::Payload;
use crate::hooks::HookOutcome;
use crate::hooks::Pending;
use crate::llm::chat_with_retry;
use crate::object_id::CommitId;
use crate::op_store::EventId;
use crate::op_store::EventKind;
use crate::tract::Tract;
use crate::tract::TractError;
use crate::tract::TractResult;

const DEFAULT_COMPRESS_PROMPT: &str = "Summarize the following context entries into a compact \
     note that preserves every fact, decision, and open question a future reader would need. \
     Reply with the summary only.";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompressMode {
    #[default]
    Autonomous,
    Collaborative,
}

#[derive(Clone, Debug, Default)]
pub struct CompressOptions {
    /// Commits to compress. Defaults to every NORMAL commit reachable from
    /// HEAD.
    pub selection: Option<Vec<CommitId>>,
    /// Soft budget hint passed to the resolver.
    pub target_tokens: Option<u64>,
    /// Appended to the default summarization prompt.
    pub instructions: Option<String>,
    /// Replaces the default summarization prompt. Mutually exclusive with
    /// `instructions`.
    pub system_prompt: Option<String>,
    /// Temporary pins for this pass. Cannot unpin a permanent PINNED.
    pub preserve: Vec<CommitId>,
    pub mode: CompressMode,
    pub config: Option<LlmConfig>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SummaryDraft {
    /// The resolver's proposed summary. Editable before approval.
    pub text: String,
    /// The commits this summary replaces, in chain order.
    pub sources: Vec<CommitId>,
}

#[derive(Clone, Debug)]
enum LayoutItem {
    /// The summary of group `index`, at the position of its first source.
    Summary(usize),
    /// A commit carried through verbatim (pinned, unselected, or a marker).
    Keep { payload: Payload, pinned: bool },
}

/// Everything apply needs, captured at plan time.
#[derive(Clone, Debug)]
pub struct PendingCompress {
    pub drafts: Vec<SummaryDraft>,
    branch: String,
    head: CommitId,
    layout: Vec<LayoutItem>,
    preserved: Vec<CommitId>,
    original_tokens: u64,
    target_tokens: Option<u64>,
    mode: CompressMode,
}

#[derive(Clone, Debug)]
pub struct CompressReport {
    pub event: EventId,
    pub summaries: Vec<CommitId>,
    pub preserved: Vec<CommitId>,
    pub new_head: CommitId,
    pub original_tokens: u64,
    pub compressed_tokens: u64,
}

#[derive(Clone, Debug)]
pub enum CompressOutcome {
    Applied(CompressReport),
    Pending(Pending<PendingCompress>),
    /// Nothing to compress; the tract is untouched.
    Skipped { reason: String },
}

#[instrument(skip(tract, options))]
pub(crate) fn compress(tract: &Tract, options: CompressOptions) -> TractResult<CompressOutcome> {
    if options.instructions.is_some() && options.system_prompt.is_some() {
        return Err(TractError::ConflictingOptions(
            "instructions and system_prompt are mutually exclusive",
        ));
    }
    let branch = tract.current_branch()?;
    let Some(head) = tract.head_commit_id()? else {
        return Ok(CompressOutcome::Skipped {
            reason: "tract is empty".to_string(),
        });
    };

    let pending = plan(tract, branch, head, &options)?;
    let Some(pending) = pending else {
        warn!(tract = %tract.id(), "nothing to compress; every commit is pinned or skipped");
        return Ok(CompressOutcome::Skipped {
            reason: "no NORMAL commits in selection".to_string(),
        });
    };

    match options.mode {
        CompressMode::Collaborative => Ok(CompressOutcome::Pending(Pending {
            operation: "compress",
            draft: pending,
        })),
        CompressMode::Autonomous => apply_pending(tract, pending),
    }
}

/// Groups the NORMAL selection, calls the resolver per group, and captures
/// the replay layout. Holds no transaction across the model calls.
fn plan(
    tract: &Tract,
    branch: String,
    head: CommitId,
    options: &CompressOptions,
) -> TractResult<Option<PendingCompress>> {
    let store = tract.store();
    let chain = compile::collect_chain(store, &head)?;
    let annotations = store.effective_annotations(tract.id())?;

    // Effective payloads after EDIT override, as compression consumes them.
    let mut edit_map = std::collections::HashMap::new();
    for id in &chain {
        let commit = store.get_commit(id)?;
        if commit.op() == CommitOp::Edit
            && let Some(target) = commit.edit_target()
        {
            edit_map.insert(target.clone(), commit.content_id().clone());
        }
    }

    let mut layout = Vec::new();
    let mut groups: Vec<Vec<(CommitId, String, u64)>> = Vec::new();
    let mut preserved = Vec::new();
    let mut group_open = false;
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

        let is_marker = matches!(payload, Payload::Session { .. } | Payload::Spawn { .. });
        let temporarily_preserved = options.preserve.contains(id);
        let pinned = priority == Priority::Pinned;
        let selected = options
            .selection
            .as_ref()
            .is_none_or(|selection| selection.contains(id));

        if pinned || temporarily_preserved || is_marker || !selected {
            if pinned || temporarily_preserved {
                preserved.push(id.clone());
            }
            // A session boundary closes the current group.
            if is_marker {
                group_open = false;
            }
            layout.push(LayoutItem::Keep { payload, pinned });
            continue;
        }

        let tokens = tract.tokenizer().count_payload(&payload);
        let text = payload.prompt_text();
        if !group_open {
            groups.push(Vec::new());
            layout.push(LayoutItem::Summary(groups.len() - 1));
            group_open = true;
        }
        groups
            .last_mut()
            .unwrap()
            .push((id.clone(), text, tokens));
    }

    if groups.is_empty() {
        return Ok(None);
    }

    let configs = tract.configs();
    let effective = configs.resolve(&configs.compress, options.config.as_ref());
    let system_prompt = match (&options.system_prompt, &options.instructions) {
        (Some(prompt), _) => prompt.clone(),
        (None, Some(instructions)) => format!("{DEFAULT_COMPRESS_PROMPT}\n\n{instructions}"),
        (None, None) => DEFAULT_COMPRESS_PROMPT.to_string(),
    };

    let mut drafts = Vec::with_capacity(groups.len());
    let mut original_tokens = 0;
    for group in &groups {
        let sources: Vec<CommitId> = group.iter().map(|(id, _, _)| id.clone()).collect();
        let group_tokens: u64 = group.iter().map(|(_, _, tokens)| tokens).sum();
        original_tokens += group_tokens;

        let mut user = group
            .iter()
            .map(|(_, text, _)| format!("- {text}"))
            .collect::<Vec<_>>()
            .join("\n");
        if let Some(target) = options.target_tokens {
            user.push_str(&format!("\n\nTarget length: about {target} tokens."));
        }
        let messages = vec![
            Message {
                role: MessageRole::System,
                content: system_prompt.clone(),
                source_commit: sources[0].clone(),
                tokens: 0,
            },
            Message {
                role: MessageRole::User,
                content: user,
                source_commit: sources[0].clone(),
                tokens: 0,
            },
        ];
        let response = chat_with_retry(
            tract.llm().as_ref(),
            &messages,
            &effective,
            tract.retry_policy(),
        )?;
        drafts.push(SummaryDraft {
            text: response.text,
            sources,
        });
    }

    Ok(Some(PendingCompress {
        drafts,
        branch,
        head,
        layout,
        preserved,
        original_tokens,
        target_tokens: options.target_tokens,
        mode: options.mode,
    }))
}

/// Applies a planned compression: rewrites the branch chain as summaries
/// plus carried-through commits, and records the compress event binding
/// sources to results. The caller may have edited the draft texts.
#[instrument(skip(tract, pending))]
pub(crate) fn apply_pending(
    tract: &Tract,
    mut pending: PendingCompress,
) -> TractResult<CompressOutcome> {
    let store = tract.store();
    if tract.head_commit_id()?.as_ref() != Some(&pending.head) {
        return Err(TractError::StalePending("compress"));
    }

    let plan_json = serde_json::json!({
        "mode": match pending.mode {
            CompressMode::Autonomous => "autonomous",
            CompressMode::Collaborative => "collaborative",
        },
        "target_tokens": pending.target_tokens,
        "groups": pending.drafts.len(),
        "summaries": pending.drafts.iter().map(|d| d.text.clone()).collect::<Vec<_>>(),
    });
    match tract.hooks().fire("compress", plan_json) {
        HookOutcome::Rejected { reason } => {
            return Err(TractError::HookRejected {
                operation: "compress",
                reason,
            });
        }
        HookOutcome::Approved { plan } => {
            if let Some(texts) = plan.get("summaries").and_then(|s| s.as_array()) {
                for (draft, text) in pending.drafts.iter_mut().zip(texts) {
                    if let Some(text) = text.as_str() {
                        draft.text = text.to_string();
                    }
                }
            }
        }
    }

    store.in_savepoint(|| {
        let mut previous: Option<CommitId> = None;
        let mut summaries = Vec::new();
        let mut compressed_tokens = 0;
        let mut pinned_replays = Vec::new();
        for item in &pending.layout {
            let new = match item {
                LayoutItem::Summary(index) => {
                    let draft = &pending.drafts[*index];
                    let tokens = tract.tokenizer().count(&draft.text);
                    compressed_tokens += tokens;
                    let commit = tract.write_payload_commit(
                        Payload::opaque(draft.text.clone()),
                        previous.clone().into_iter().collect(),
                        CommitOp::Append,
                        None,
                        Some(format!("compressed {} commits", draft.sources.len())),
                        Some(tokens),
                        None,
                        None,
                    )?;
                    summaries.push(commit.id().clone());
                    commit
                }
                LayoutItem::Keep {
                    payload, pinned, ..
                } => {
                    let commit = tract.write_payload_commit(
                        payload.clone(),
                        previous.clone().into_iter().collect(),
                        CommitOp::Append,
                        None,
                        None,
                        None,
                        None,
                        None,
                    )?;
                    if *pinned {
                        pinned_replays.push(commit.id().clone());
                    }
                    commit
                }
            };
            previous = Some(new.id().clone());
        }
        let new_head = previous.expect("layout contains at least one summary");

        // Permanent pins carry forward onto their replayed commits.
        for id in &pinned_replays {
            store.annotate(
                tract.id(),
                id,
                Priority::Pinned,
                Some("carried through compression"),
            )?;
        }

        let sources: Vec<CommitId> = pending
            .drafts
            .iter()
            .flat_map(|draft| draft.sources.iter().cloned())
            .collect();
        let event = store.record_event(
            tract.id(),
            EventKind::Compress,
            &serde_json::json!({
                "operation": "compress",
                "branch": pending.branch,
                "target_tokens": pending.target_tokens,
                "groups": pending.drafts.len(),
            }),
            pending.original_tokens,
            compressed_tokens,
            &sources,
            &summaries,
            &pending.preserved,
        )?;
        store.set_branch(tract.id(), &pending.branch, &new_head)?;

        Ok(CompressOutcome::Applied(CompressReport {
            event,
            summaries,
            preserved: pending.preserved.clone(),
            new_head,
            original_tokens: pending.original_tokens,
            compressed_tokens,
        }))
    })
}
