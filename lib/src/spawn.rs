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

//! Cross-tract spawn and collapse. A spawned child lives in its own tract,
//! linked to the parent commit through a spawn pointer; collapse folds the
//! child's compiled context back into the parent as a summary commit.

use std::collections::HashMap;
use std::collections::HashSet;

use itertools::Itertools as _;
use tracing::instrument;

use crate::commit::Commit;
use crate::commit::CommitData;
use crate::commit::CommitOp;
use crate::commit::MillisSinceEpoch;
use crate::compile::Message;
use crate::compile::MessageRole;
use crate::config::LlmConfig;
use crate::content::Payload;
use crate::dag_walk;
use crate::llm::chat_with_retry;
use crate::object_id::CommitId;
use crate::object_id::TractId;
pub use crate::op_store::InheritanceMode as SpawnMode;
use crate::store::DEFAULT_BRANCH;
use crate::store::Head;
use crate::store::Store;
use crate::tract::Tract;
use crate::tract::TractError;
use crate::tract::TractResult;

const COLLAPSE_PROMPT: &str = "A sub-context has finished its work. Summarize its full \
     transcript into the conclusions and artifacts the parent context needs. Reply with the \
     summary only.";

/// Curation pipeline for `SpawnMode::Branch`, applied in fixed order:
/// keep → drop → compact_before → reorder.
#[derive(Clone, Debug, Default)]
pub struct Curation {
    /// When set, only these commits survive.
    pub keep: Option<Vec<CommitId>>,
    /// Dropped after `keep`.
    pub drop: Vec<CommitId>,
    /// Commits before this one are squashed into a single opaque commit.
    pub compact_before: Option<CommitId>,
    /// Desired order of the remaining commits; unmentioned commits keep
    /// their relative position at the end.
    pub reorder: Option<Vec<CommitId>>,
}

/// Creates a child tract inheriting from the parent's head per `mode`, and
/// records the spawn pointer. The parent chain gets a spawn marker commit
/// when its HEAD is attached.
#[instrument(skip(parent, curation))]
pub(crate) fn spawn(
    parent: &Tract,
    mode: SpawnMode,
    purpose: &str,
    curation: Option<Curation>,
) -> TractResult<Tract> {
    let store = parent.store();
    let head = parent.head_commit_id()?.ok_or(TractError::EmptyTract)?;

    // A corrupt spawn graph would loop forever below; detect it up front.
    spawn_ancestry(store, parent.id())?;

    store.in_savepoint(|| {
        let child_id = store.create_tract(purpose)?;
        let child = Tract::new(
            store.clone(),
            child_id.clone(),
            parent.capabilities().clone(),
            parent.configs().clone(),
        );

        match mode {
            SpawnMode::HeadSnapshot => {
                let compiled = parent.compile_at(&head)?;
                let root = child.write_payload_commit(
                    Payload::opaque(compiled.transcript()),
                    vec![],
                    CommitOp::Append,
                    None,
                    Some("snapshot of parent context".to_string()),
                    None,
                    None,
                    None,
                )?;
                store.set_branch(&child_id, DEFAULT_BRANCH, root.id())?;
            }
            SpawnMode::FullClone => {
                let tip = replay_reachable(store, parent, &child, &head)?;
                store.set_branch(&child_id, DEFAULT_BRANCH, &tip)?;
            }
            SpawnMode::Branch => {
                let branch_name = match parent.head()? {
                    Head::Attached { branch } => branch,
                    Head::Detached { .. } => DEFAULT_BRANCH.to_string(),
                };
                let tip =
                    replay_curated(store, parent, &child, &head, curation.unwrap_or_default())?;
                store.set_branch(&child_id, &branch_name, &tip)?;
                store.set_head(
                    &child_id,
                    &Head::Attached {
                        branch: branch_name,
                    },
                )?;
            }
        }

        store.record_spawn(parent.id(), Some(&head), &child_id, mode, purpose)?;
        if matches!(parent.head()?, Head::Attached { .. }) {
            parent.commit(
                Payload::Spawn {
                    child: child_id.clone(),
                    purpose: purpose.to_string(),
                },
                CommitOp::Append,
                None,
                Some(format!("spawn {purpose}")),
            )?;
        }
        Ok(child)
    })
}

/// Summarizes the child's full compiled context into a commit on the
/// parent's current branch.
#[instrument(skip(parent, child, config))]
pub(crate) fn collapse(
    parent: &Tract,
    child: &Tract,
    config: Option<&LlmConfig>,
) -> TractResult<Commit> {
    let store = parent.store();
    let branch = parent.current_branch()?;
    let parent_head = parent.head_commit_id()?.ok_or(TractError::EmptyTract)?;

    // The child must descend from the parent in the spawn graph.
    let ancestry = spawn_ancestry(store, child.id())?;
    if !ancestry.contains(parent.id()) {
        return Err(TractError::NotSpawnRelated {
            parent: parent.id().clone(),
            child: child.id().clone(),
        });
    }

    let compiled = child.compile()?;
    let configs = parent.configs();
    let effective = configs.resolve(&configs.collapse, config);
    let messages = vec![
        Message {
            role: MessageRole::System,
            content: COLLAPSE_PROMPT.to_string(),
            source_commit: parent_head.clone(),
            tokens: 0,
        },
        Message {
            role: MessageRole::User,
            content: compiled.transcript(),
            source_commit: parent_head.clone(),
            tokens: 0,
        },
    ];
    let response = chat_with_retry(
        parent.llm().as_ref(),
        &messages,
        &effective,
        parent.retry_policy(),
    )?;

    let mut recorded_config = effective;
    if recorded_config.model.is_none() {
        recorded_config.model = response.model.clone();
    }
    store.in_savepoint(|| {
        let commit = parent.write_payload_commit(
            Payload::opaque(response.text.clone()),
            vec![parent_head.clone()],
            CommitOp::Append,
            None,
            Some(format!("collapse of tract {}", child.id())),
            response.usage.map(|usage| usage.completion_tokens),
            Some(recorded_config.clone()),
            response.usage,
        )?;
        store.set_branch(parent.id(), &branch, commit.id())?;
        Ok(commit)
    })
}

/// Walks the spawn graph upward from `tract`. Returns every ancestor tract;
/// a repeated visit is a cycle and fatal.
fn spawn_ancestry(store: &Store, tract: &TractId) -> TractResult<HashSet<TractId>> {
    let mut visited: HashSet<TractId> = HashSet::new();
    let mut stack = vec![tract.clone()];
    while let Some(current) = stack.pop() {
        for pointer in store.spawn_parents_of(&current)? {
            if pointer.parent_tract == *tract {
                return Err(TractError::SpawnCycle(tract.clone()));
            }
            if visited.insert(pointer.parent_tract.clone()) {
                stack.push(pointer.parent_tract);
            }
        }
    }
    Ok(visited)
}

/// Replays every commit reachable from `head` into the child tract,
/// preserving DAG shape, edit targets, and annotations. Content blobs are
/// shared; deduplication makes the clone cheap.
fn replay_reachable(
    store: &std::sync::Arc<Store>,
    parent: &Tract,
    child: &Tract,
    head: &CommitId,
) -> TractResult<CommitId> {
    let reachable = dag_walk::walk_ancestors(store, std::slice::from_ref(head))?;
    let annotations = store.effective_annotations(parent.id())?;

    let mut rewritten: HashMap<CommitId, CommitId> = HashMap::new();
    // Parents must exist before children; sweep until every commit lands.
    let mut remaining: Vec<CommitId> = reachable.into_iter().rev().collect();
    while !remaining.is_empty() {
        let before = remaining.len();
        let mut deferred = Vec::new();
        for old_id in remaining {
            let old = store.get_commit(&old_id)?;
            if !old.parent_ids().iter().all(|p| rewritten.contains_key(p)) {
                deferred.push(old_id);
                continue;
            }
            let new = store.write_commit(CommitData {
                tract: child.id().clone(),
                content: old.content_id().clone(),
                parents: old
                    .parent_ids()
                    .iter()
                    .map(|p| rewritten[p].clone())
                    .collect(),
                op: old.op(),
                edit_target: old
                    .edit_target()
                    .map(|t| rewritten.get(t).cloned().unwrap_or_else(|| t.clone())),
                token_count: old.token_count(),
                timestamp: MillisSinceEpoch::now(),
                message: old.message().map(str::to_owned),
                generation_config: old.generation_config().cloned(),
                usage: old.usage().copied(),
            })?;
            if let Some(priority) = annotations.get(&old_id) {
                store.annotate(child.id(), new.id(), *priority, Some("inherited from parent"))?;
            }
            rewritten.insert(old_id, new.id().clone());
        }
        if deferred.len() == before {
            return Err(crate::store::StoreError::CycleDetected(deferred[0].clone()).into());
        }
        remaining = deferred;
    }
    Ok(rewritten[head].clone())
}

/// Replays the first-parent chain of `head` into the child after the
/// curation pipeline: keep → drop → compact_before → reorder.
fn replay_curated(
    store: &std::sync::Arc<Store>,
    parent: &Tract,
    child: &Tract,
    head: &CommitId,
    curation: Curation,
) -> TractResult<CommitId> {
    let mut chain = dag_walk::first_parent_chain(store, head)?;
    chain.reverse();

    // Materialize EDIT overrides: the child receives effective content, not
    // override records.
    let mut edit_map: HashMap<CommitId, crate::object_id::ContentId> = HashMap::new();
    for id in &chain {
        let commit = store.get_commit(id)?;
        if commit.op() == CommitOp::Edit
            && let Some(target) = commit.edit_target()
        {
            edit_map.insert(target.clone(), commit.content_id().clone());
        }
    }
    {
        let mut materialized = Vec::with_capacity(chain.len());
        for id in chain {
            if store.get_commit(&id)?.op() != CommitOp::Edit {
                materialized.push(id);
            }
        }
        chain = materialized;
    }

    if let Some(keep) = &curation.keep {
        chain.retain(|id| keep.contains(id));
    }
    chain.retain(|id| !curation.drop.contains(id));

    let mut compacted_prefix: Option<String> = None;
    if let Some(pivot) = &curation.compact_before
        && let Some(position) = chain.iter().position(|id| id == pivot)
        && position > 0
    {
        let mut texts = Vec::new();
        for id in chain.drain(..position) {
            let commit = store.get_commit(&id)?;
            let content = edit_map.get(&id).unwrap_or_else(|| commit.content_id());
            let text = store.get_blob(content)?.prompt_text();
            if !text.is_empty() {
                texts.push(text);
            }
        }
        compacted_prefix = Some(texts.iter().join("\n"));
    }

    if let Some(reorder) = &curation.reorder {
        let mentioned: Vec<CommitId> = reorder
            .iter()
            .filter(|id| chain.contains(id))
            .cloned()
            .collect();
        let rest: Vec<CommitId> = chain
            .iter()
            .filter(|id| !mentioned.contains(id))
            .cloned()
            .collect();
        chain = mentioned.into_iter().chain(rest).collect();
    }

    let mut previous: Option<CommitId> = None;
    if let Some(text) = compacted_prefix {
        let commit = child.write_payload_commit(
            Payload::opaque(text),
            vec![],
            CommitOp::Append,
            None,
            Some("compacted history".to_string()),
            None,
            None,
            None,
        )?;
        previous = Some(commit.id().clone());
    }
    let annotations = store.effective_annotations(parent.id())?;
    for old_id in &chain {
        let old = store.get_commit(old_id)?;
        let content = edit_map
            .get(old_id)
            .cloned()
            .unwrap_or_else(|| old.content_id().clone());
        let new = store.write_commit(CommitData {
            tract: child.id().clone(),
            content,
            parents: previous.clone().into_iter().collect(),
            op: CommitOp::Append,
            edit_target: None,
            token_count: old.token_count(),
            timestamp: MillisSinceEpoch::now(),
            message: old.message().map(str::to_owned),
            generation_config: old.generation_config().cloned(),
            usage: old.usage().copied(),
        })?;
        if let Some(priority) = annotations.get(old_id) {
            store.annotate(child.id(), new.id(), *priority, Some("inherited from parent"))?;
        }
        previous = Some(new.id().clone());
    }
    previous.ok_or(TractError::EmptyTract)
}
