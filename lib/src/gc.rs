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

//! Reachability-based garbage collection. Runs only on explicit invocation.
//!
//! Reachability seeds: every ref of the tract, every spawn pointer into the
//! tract's commits, and every commit a compile record mentions; the seed
//! set closes transitively over parent edges. Unreachable commits split
//! into *archived* (referenced by an operation event, protected unless the
//! caller lowers archive retention) and *orphans* (removed once older than
//! the orphan retention window).

use std::collections::HashSet;
use std::time::Duration;

use tracing::info;
use tracing::instrument;

use crate::commit::MillisSinceEpoch;
use crate::dag_walk;
use crate::hooks::HookOutcome;
use crate::object_id::CommitId;
use crate::tract::Tract;
use crate::tract::TractError;
use crate::tract::TractResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GcOptions {
    /// How long an unreachable, event-free commit survives.
    pub orphan_retention: Duration,
    /// Unset means archived commits (compress sources and other
    /// event-referenced commits) are never collected.
    pub archive_retention: Option<Duration>,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            orphan_retention: Duration::from_secs(7 * 24 * 60 * 60),
            archive_retention: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcStats {
    pub commits_removed: u64,
    pub tokens_freed: u64,
    pub archives_removed: u64,
}

#[instrument(skip(tract))]
pub(crate) fn collect(tract: &Tract, options: GcOptions) -> TractResult<GcStats> {
    let store = tract.store();

    let mut seeds: Vec<CommitId> = store.ref_targets(tract.id())?;
    for pointer in store.spawns_from(tract.id())? {
        if let Some(commit) = pointer.parent_commit {
            seeds.push(commit);
        }
    }
    seeds.extend(store.compile_referenced_commits(tract.id())?);
    seeds.sort();
    seeds.dedup();
    // Compile records and spawn pointers may outlive the commits they name.
    let mut live_seeds = Vec::with_capacity(seeds.len());
    for id in seeds {
        if store.commit_exists(&id)? {
            live_seeds.push(id);
        }
    }
    let seeds = live_seeds;

    let reachable: HashSet<CommitId> =
        dag_walk::walk_ancestors(store, &seeds)?.into_iter().collect();

    let now = MillisSinceEpoch::now();
    let old_enough = |timestamp: MillisSinceEpoch, retention: Duration| {
        let age = now.0.saturating_sub(timestamp.0);
        age >= 0 && age as u128 >= retention.as_millis()
    };

    let mut orphans = Vec::new();
    let mut archives = Vec::new();
    for (id, timestamp, tokens) in store.commit_gc_meta(tract.id())? {
        if reachable.contains(&id) {
            continue;
        }
        if store.event_references(&id)? {
            if let Some(retention) = options.archive_retention
                && old_enough(timestamp, retention)
            {
                archives.push((id, tokens));
            }
        } else if old_enough(timestamp, options.orphan_retention) {
            orphans.push((id, tokens));
        }
    }

    let plan = serde_json::json!({
        "orphans": orphans.len(),
        "archives": archives.len(),
    });
    if let HookOutcome::Rejected { reason } = tract.hooks().fire("gc", plan) {
        return Err(TractError::HookRejected {
            operation: "gc",
            reason,
        });
    }

    let stats = store.in_savepoint(|| {
        let mut stats = GcStats::default();
        let mut freed_blobs = Vec::new();
        for (id, tokens) in &orphans {
            freed_blobs.push(store.delete_commit(id)?);
            stats.commits_removed += 1;
            stats.tokens_freed += tokens;
        }
        for (id, tokens) in &archives {
            freed_blobs.push(store.delete_commit(id)?);
            stats.commits_removed += 1;
            stats.archives_removed += 1;
            stats.tokens_freed += tokens;
        }
        freed_blobs.sort();
        freed_blobs.dedup();
        for content in &freed_blobs {
            store.delete_blob_if_unreferenced(content)?;
        }
        Ok::<_, TractError>(stats)
    })?;

    info!(
        tract = %tract.id(),
        commits_removed = stats.commits_removed,
        tokens_freed = stats.tokens_freed,
        archives_removed = stats.archives_removed,
        "garbage collection finished"
    );
    Ok(stats)
}
