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

//! Iterative walks over the commit DAG. All walks carry a visited set; none
//! recurse, so deep or damaged ancestries cannot overflow the stack.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::object_id::CommitId;
use crate::store::Store;
use crate::store::StoreError;
use crate::store::StoreResult;

/// The first-parent chain from `head` down to the root, head first.
/// A commit appearing twice on its own mainline is a cycle and fatal.
pub fn first_parent_chain(store: &Arc<Store>, head: &CommitId) -> StoreResult<Vec<CommitId>> {
    let mut chain = Vec::new();
    let mut visited = HashSet::new();
    let mut current = Some(head.clone());
    while let Some(id) = current {
        if !visited.insert(id.clone()) {
            return Err(StoreError::CycleDetected(id));
        }
        let commit = store.get_commit(&id)?;
        current = commit.first_parent_id().cloned();
        chain.push(id);
    }
    Ok(chain)
}

/// First-parent ancestors of `head` (inclusive), newest first, up to `limit`.
pub fn ancestors(
    store: &Arc<Store>,
    head: &CommitId,
    limit: Option<usize>,
) -> StoreResult<Vec<CommitId>> {
    let mut chain = first_parent_chain(store, head)?;
    if let Some(limit) = limit {
        chain.truncate(limit);
    }
    Ok(chain)
}

/// Every ancestor of `start` (inclusive) through all parents, in breadth-first
/// discovery order.
pub fn walk_ancestors(store: &Arc<Store>, start: &[CommitId]) -> StoreResult<Vec<CommitId>> {
    let mut visited: HashSet<CommitId> = start.iter().cloned().collect();
    let mut queue: VecDeque<CommitId> = start.iter().cloned().collect();
    let mut out = Vec::new();
    while let Some(id) = queue.pop_front() {
        let commit = store.get_commit(&id)?;
        for parent in commit.parent_ids() {
            if visited.insert(parent.clone()) {
                queue.push_back(parent.clone());
            }
        }
        out.push(id);
    }
    Ok(out)
}

/// Whether `ancestor` is an ancestor of `commit` (or equal to it), walking
/// all parents iteratively.
pub fn has_ancestor(
    store: &Arc<Store>,
    commit: &CommitId,
    ancestor: &CommitId,
) -> StoreResult<bool> {
    let mut visited = HashSet::new();
    let mut stack = vec![commit.clone()];
    while let Some(id) = stack.pop() {
        if id == *ancestor {
            return Ok(true);
        }
        if !visited.insert(id.clone()) {
            continue;
        }
        let loaded = store.get_commit(&id)?;
        stack.extend(loaded.parent_ids().iter().cloned());
    }
    Ok(false)
}

/// The merge base of `a` and `b`: the first commit on `a`'s first-parent
/// chain that is also in the full ancestry of `b`.
pub fn merge_base(
    store: &Arc<Store>,
    a: &CommitId,
    b: &CommitId,
) -> StoreResult<Option<CommitId>> {
    let b_ancestry: HashSet<CommitId> =
        walk_ancestors(store, std::slice::from_ref(b))?.into_iter().collect();
    for id in first_parent_chain(store, a)? {
        if b_ancestry.contains(&id) {
            return Ok(Some(id));
        }
    }
    Ok(None)
}

/// The simple first-parent path `from..=to` in chronological order
/// (excluding `from`, including `to`), or `None` if `to` does not descend
/// from `from` along first parents.
pub fn between(
    store: &Arc<Store>,
    from: &CommitId,
    to: &CommitId,
) -> StoreResult<Option<Vec<CommitId>>> {
    let mut path = Vec::new();
    for id in first_parent_chain(store, to)? {
        if id == *from {
            path.reverse();
            return Ok(Some(path));
        }
        path.push(id);
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::Commit;
    use crate::commit::CommitData;
    use crate::commit::CommitOp;
    use crate::commit::MillisSinceEpoch;
    use crate::content::DialogueRole;
    use crate::content::Payload;
    use crate::object_id::TractId;

    struct Dag {
        _dir: tempfile::TempDir,
        store: Arc<Store>,
        tract: TractId,
    }

    impl Dag {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Store::open(&dir.path().join("store.db")).unwrap();
            let tract = store.create_tract("dag").unwrap();
            Self {
                _dir: dir,
                store,
                tract,
            }
        }

        fn commit(&self, text: &str, parents: &[&Commit]) -> Commit {
            let payload = Payload::dialogue(DialogueRole::User, text);
            let content = self.store.put_blob(&payload, 1).unwrap();
            self.store
                .write_commit(CommitData {
                    tract: self.tract.clone(),
                    content,
                    parents: parents.iter().map(|c| c.id().clone()).collect(),
                    op: CommitOp::Append,
                    edit_target: None,
                    token_count: 1,
                    timestamp: MillisSinceEpoch::now(),
                    message: Some(text.to_string()),
                    generation_config: None,
                    usage: None,
                })
                .unwrap()
        }
    }

    #[test]
    fn test_first_parent_chain_order() {
        let dag = Dag::new();
        let a = dag.commit("a", &[]);
        let b = dag.commit("b", &[&a]);
        let c = dag.commit("c", &[&b]);
        assert_eq!(
            first_parent_chain(&dag.store, c.id()).unwrap(),
            vec![c.id().clone(), b.id().clone(), a.id().clone()]
        );
        assert_eq!(
            ancestors(&dag.store, c.id(), Some(2)).unwrap(),
            vec![c.id().clone(), b.id().clone()]
        );
    }

    #[test]
    fn test_has_ancestor_crosses_merge_parents() {
        let dag = Dag::new();
        let a = dag.commit("a", &[]);
        let side = dag.commit("side", &[]);
        let merge = dag.commit("merge", &[&a, &side]);

        assert!(has_ancestor(&dag.store, merge.id(), a.id()).unwrap());
        assert!(has_ancestor(&dag.store, merge.id(), side.id()).unwrap());
        assert!(has_ancestor(&dag.store, merge.id(), merge.id()).unwrap());
        assert!(!has_ancestor(&dag.store, a.id(), merge.id()).unwrap());

        // Antisymmetric for distinct commits.
        assert!(!(has_ancestor(&dag.store, merge.id(), a.id()).unwrap()
            && has_ancestor(&dag.store, a.id(), merge.id()).unwrap()
            && merge.id() != a.id()));
    }

    #[test]
    fn test_merge_base_of_diverged_branches() {
        let dag = Dag::new();
        let base = dag.commit("base", &[]);
        let left = dag.commit("left", &[&base]);
        let right = dag.commit("right", &[&base]);

        assert_eq!(
            merge_base(&dag.store, left.id(), right.id()).unwrap(),
            Some(base.id().clone())
        );
        // The base of a commit and its descendant is the ancestor itself.
        assert_eq!(
            merge_base(&dag.store, left.id(), base.id()).unwrap(),
            Some(base.id().clone())
        );
        // Unrelated roots share no base.
        let island = dag.commit("island", &[]);
        assert_eq!(merge_base(&dag.store, left.id(), island.id()).unwrap(), None);
    }

    #[test]
    fn test_between_returns_chronological_path() {
        let dag = Dag::new();
        let a = dag.commit("a", &[]);
        let b = dag.commit("b", &[&a]);
        let c = dag.commit("c", &[&b]);

        assert_eq!(
            between(&dag.store, a.id(), c.id()).unwrap(),
            Some(vec![b.id().clone(), c.id().clone()])
        );
        assert_eq!(between(&dag.store, c.id(), a.id()).unwrap(), None);
        assert_eq!(between(&dag.store, a.id(), a.id()).unwrap(), Some(vec![]));
    }

    #[test]
    fn test_walk_ancestors_covers_all_parents() {
        let dag = Dag::new();
        let a = dag.commit("a", &[]);
        let b = dag.commit("b", &[&a]);
        let side = dag.commit("side", &[&a]);
        let merge = dag.commit("merge", &[&b, &side]);

        let all = walk_ancestors(&dag.store, &[merge.id().clone()]).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0], *merge.id());
        assert!(all.contains(b.id()));
        assert!(all.contains(side.id()));
        assert!(all.contains(a.id()));
    }
}
