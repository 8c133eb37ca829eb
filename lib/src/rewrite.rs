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

//! Rebase and commit import. Both replay existing commits as new commits
//! with new hashes; the originals stay in the DAG (possibly unreachable)
//! and the old→new map is recorded as a provenance event.

use std::collections::HashMap;
use std::collections::HashSet;

use tracing::instrument;

use crate::commit::Commit;
use crate::commit::CommitData;
use crate::commit::MillisSinceEpoch;
use crate::content::Payload;
use crate::dag_walk;
use crate::hooks::HookOutcome;
use crate::object_id::CommitId;
use crate::op_store::EventId;
use crate::op_store::EventKind;
use crate::tract::Tract;
use crate::tract::TractError;
use crate::tract::TractResult;

/// Non-fatal findings from the pre-replay safety checks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RewriteWarning {
    /// An EDIT commit would be replayed before (or without) its target.
    EditBeforeTarget { edit: CommitId, target: CommitId },
    /// A tool result whose originating call is not in the new chain.
    BrokenToolChain { commit: CommitId, call_id: String },
}

#[derive(Clone, Debug)]
pub struct RebaseOutcome {
    pub branch: String,
    /// Replayed commits, oldest first. Empty when the branch was already on
    /// top of the destination.
    pub new_commits: Vec<CommitId>,
    pub event: Option<EventId>,
    pub warnings: Vec<RewriteWarning>,
}

#[derive(Clone, Debug)]
pub struct ImportOutcome {
    pub commit: Commit,
    pub event: EventId,
    pub warnings: Vec<RewriteWarning>,
}

/// Replays the commits of `branch` (default: the current branch) onto the
/// head of `onto`, then moves the branch ref. Records a reorganize event
/// mapping old commits to new by position.
#[instrument(skip(tract))]
pub(crate) fn rebase(
    tract: &Tract,
    branch: Option<&str>,
    onto: &str,
) -> TractResult<RebaseOutcome> {
    let store = tract.store();
    let branch = match branch {
        Some(name) => name.to_string(),
        None => tract.current_branch()?,
    };
    let source_head = store
        .branch_target(tract.id(), &branch)?
        .ok_or_else(|| TractError::UnknownBranch(branch.clone()))?;
    let onto_head = store
        .branch_target(tract.id(), onto)?
        .ok_or_else(|| TractError::UnknownBranch(onto.to_string()))?;

    let base = dag_walk::merge_base(store, &source_head, &onto_head)?;
    let to_replay = match &base {
        Some(base) => dag_walk::between(store, base, &source_head)?.unwrap_or_default(),
        None => {
            let mut chain = dag_walk::first_parent_chain(store, &source_head)?;
            chain.reverse();
            chain
        }
    };
    if to_replay.is_empty() {
        return Ok(RebaseOutcome {
            branch,
            new_commits: Vec::new(),
            event: None,
            warnings: Vec::new(),
        });
    }

    let warnings = safety_checks(tract, &onto_head, &to_replay)?;

    let plan = serde_json::json!({
        "branch": branch,
        "onto": onto,
        "commits": to_replay.len(),
    });
    if let HookOutcome::Rejected { reason } = tract.hooks().fire("rebase", plan) {
        return Err(TractError::HookRejected {
            operation: "rebase",
            reason,
        });
    }

    store.in_savepoint(|| {
        let mut rewritten: HashMap<CommitId, CommitId> = HashMap::new();
        let mut new_commits = Vec::with_capacity(to_replay.len());
        let mut new_parent = onto_head.clone();
        let mut original_tokens = 0;
        for old_id in &to_replay {
            let old = store.get_commit(old_id)?;
            original_tokens += old.token_count();
            let mut parents = vec![new_parent.clone()];
            for extra in old.parent_ids().iter().skip(1) {
                parents.push(rewritten.get(extra).cloned().unwrap_or_else(|| extra.clone()));
            }
            let edit_target = old
                .edit_target()
                .map(|target| rewritten.get(target).cloned().unwrap_or_else(|| target.clone()));
            let new = store.write_commit(CommitData {
                tract: tract.id().clone(),
                content: old.content_id().clone(),
                parents,
                op: old.op(),
                edit_target,
                token_count: old.token_count(),
                timestamp: MillisSinceEpoch::now(),
                message: old.message().map(str::to_owned),
                generation_config: old.generation_config().cloned(),
                usage: old.usage().copied(),
            })?;
            rewritten.insert(old_id.clone(), new.id().clone());
            new_parent = new.id().clone();
            new_commits.push(new.id().clone());
        }

        let event = store.record_event(
            tract.id(),
            EventKind::Reorganize,
            &serde_json::json!({"operation": "rebase", "branch": branch, "onto": onto}),
            original_tokens,
            original_tokens,
            &to_replay,
            &new_commits,
            &[],
        )?;
        store.set_branch(tract.id(), &branch, &new_parent)?;

        Ok(RebaseOutcome {
            branch: branch.clone(),
            new_commits,
            event: Some(event),
            warnings,
        })
    })
}

/// Replays one commit (possibly from another tract) onto HEAD and records an
/// import event. Importing an EDIT whose target is missing from the
/// destination chain is an invariant error, not a warning.
#[instrument(skip(tract))]
pub(crate) fn import(tract: &Tract, source: &CommitId) -> TractResult<ImportOutcome> {
    let store = tract.store();
    let branch = tract.current_branch()?;
    let head = store.head_commit(tract.id())?;
    let old = store.get_commit(source)?;

    if let Some(target) = old.edit_target() {
        let reachable = match &head {
            Some(head) => dag_walk::has_ancestor(store, head, target)?,
            None => false,
        };
        if !reachable {
            return Err(TractError::EditBeforeTarget(target.clone()));
        }
    }
    let warnings = match &head {
        Some(head) => safety_checks(tract, head, std::slice::from_ref(source))?,
        None => safety_checks_rootless(tract, std::slice::from_ref(source))?,
    };

    let plan = serde_json::json!({
        "source": source.to_string(),
        "from_tract": old.tract().to_string(),
    });
    if let HookOutcome::Rejected { reason } = tract.hooks().fire("import", plan) {
        return Err(TractError::HookRejected {
            operation: "import",
            reason,
        });
    }

    store.in_savepoint(|| {
        let new = store.write_commit(CommitData {
            tract: tract.id().clone(),
            content: old.content_id().clone(),
            parents: head.clone().into_iter().collect(),
            op: old.op(),
            edit_target: old.edit_target().cloned(),
            token_count: old.token_count(),
            timestamp: MillisSinceEpoch::now(),
            message: old.message().map(str::to_owned),
            generation_config: old.generation_config().cloned(),
            usage: old.usage().copied(),
        })?;
        let event = store.record_event(
            tract.id(),
            EventKind::Import,
            &serde_json::json!({
                "operation": "import",
                "from_tract": old.tract().to_string(),
            }),
            old.token_count(),
            old.token_count(),
            std::slice::from_ref(source),
            std::slice::from_ref(new.id()),
            &[],
        )?;
        store.set_branch(tract.id(), &branch, new.id())?;
        Ok(ImportOutcome {
            commit: new,
            event,
            warnings,
        })
    })
}

/// Flags EDITs replayed before their target and tool results whose call is
/// absent from the destination chain. Warnings, not failures.
fn safety_checks(
    tract: &Tract,
    destination_head: &CommitId,
    to_replay: &[CommitId],
) -> TractResult<Vec<RewriteWarning>> {
    let store = tract.store();
    let destination: HashSet<CommitId> = dag_walk::walk_ancestors(
        store,
        std::slice::from_ref(destination_head),
    )?
    .into_iter()
    .collect();

    let mut call_ids: HashSet<String> = HashSet::new();
    for id in &destination {
        let commit = store.get_commit(id)?;
        if let Payload::ToolCall { call_id, .. } = commit.payload()? {
            call_ids.insert(call_id);
        }
    }
    check_replay_order(tract, to_replay, &destination, call_ids)
}

fn safety_checks_rootless(
    tract: &Tract,
    to_replay: &[CommitId],
) -> TractResult<Vec<RewriteWarning>> {
    check_replay_order(tract, to_replay, &HashSet::new(), HashSet::new())
}

fn check_replay_order(
    tract: &Tract,
    to_replay: &[CommitId],
    destination: &HashSet<CommitId>,
    mut call_ids: HashSet<String>,
) -> TractResult<Vec<RewriteWarning>> {
    let store = tract.store();
    let mut warnings = Vec::new();
    let mut replayed: HashSet<CommitId> = HashSet::new();
    for id in to_replay {
        let commit = store.get_commit(id)?;
        if let Some(target) = commit.edit_target()
            && !replayed.contains(target)
            && !destination.contains(target)
        {
            warnings.push(RewriteWarning::EditBeforeTarget {
                edit: id.clone(),
                target: target.clone(),
            });
        }
        match commit.payload()? {
            Payload::ToolCall { call_id, .. } => {
                call_ids.insert(call_id);
            }
            Payload::ToolResult { call_id, .. } => {
                if !call_ids.contains(&call_id) {
                    warnings.push(RewriteWarning::BrokenToolChain {
                        commit: id.clone(),
                        call_id,
                    });
                }
            }
            _ => {}
        }
        replayed.insert(id.clone());
    }
    Ok(warnings)
}
