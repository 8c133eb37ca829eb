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

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use testutils::TestEnv;
use testutils::write_assistant;
use testutils::write_user;
use tract_lib::annotate::Priority;
use tract_lib::content::Payload;
use tract_lib::spawn::Curation;
use tract_lib::spawn::SpawnMode;
use tract_lib::tract::TractError;

#[test]
fn test_spawn_head_snapshot() {
    let env = TestEnv::init();
    let parent = env.tract();
    write_user(&parent, "question about lifetimes");
    write_assistant(&parent, "borrow checker explanation");
    let parent_head = parent.head_commit_id().unwrap().unwrap();

    let child = parent.spawn(SpawnMode::HeadSnapshot, "research", None).unwrap();

    // Child root is one opaque commit holding the parent's compiled text.
    let compiled = child.compile().unwrap();
    assert_eq!(compiled.messages.len(), 1);
    assert!(compiled.messages[0].content.contains("question about lifetimes"));
    assert!(compiled.messages[0].content.contains("borrow checker explanation"));

    // The pointer records mode, purpose, and the spawn-point commit.
    let pointers = parent.store().spawns_from(parent.id()).unwrap();
    assert_eq!(pointers.len(), 1);
    assert_eq!(pointers[0].child_tract, *child.id());
    assert_eq!(pointers[0].mode, SpawnMode::HeadSnapshot);
    assert_eq!(pointers[0].purpose, "research");
    assert_eq!(pointers[0].parent_commit, Some(parent_head));

    // The parent chain gained a spawn marker that renders no messages.
    let parent_tip = parent.head_commit().unwrap().unwrap();
    assert_matches!(parent_tip.payload().unwrap(), Payload::Spawn { .. });
    assert_eq!(parent.compile().unwrap().messages.len(), 2);
}

#[test]
fn test_spawn_full_clone_preserves_shape_and_annotations() {
    let env = TestEnv::init();
    let parent = env.tract();
    let a = write_user(&parent, "alpha");
    write_user(&parent, "beta");
    parent.pin(a.id(), Some("keep")).unwrap();

    let child = parent.spawn(SpawnMode::FullClone, "clone", None).unwrap();

    // Same rendered context, fresh commit hashes, shared blobs.
    let parent_compiled = parent.compile_at(a.id()).unwrap();
    let child_compiled = child.compile().unwrap();
    assert_eq!(child_compiled.messages.len(), 2);
    assert_eq!(
        child_compiled
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>(),
        vec!["alpha", "beta"]
    );
    assert_ne!(child_compiled.effective[0].0, parent_compiled.effective[0].0);

    // The pin came across.
    assert_eq!(child_compiled.effective[0].1, Priority::Pinned);

    // Blob content is deduplicated: the clone added no new blobs for "alpha".
    let cloned_root = child.store().get_commit(&child_compiled.effective[0].0).unwrap();
    assert_eq!(cloned_root.content_id(), a.content_id());
}

#[test]
fn test_spawn_branch_with_curation_pipeline() {
    let env = TestEnv::init();
    let parent = env.tract();
    write_user(&parent, "one");
    let b = write_user(&parent, "two");
    let c = write_user(&parent, "three");
    let d = write_user(&parent, "four");

    let child = parent
        .spawn(
            SpawnMode::Branch,
            "curated",
            Some(Curation {
                keep: None,
                drop: vec![b.id().clone()],
                compact_before: Some(c.id().clone()),
                reorder: Some(vec![d.id().clone(), c.id().clone()]),
            }),
        )
        .unwrap();

    // drop(two), compact(one), then reorder -> [compacted, four, three].
    let compiled = child.compile().unwrap();
    assert_eq!(
        compiled
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>(),
        vec!["one", "four", "three"]
    );

    // The child got a real branch named like the parent's.
    assert_eq!(child.current_branch().unwrap(), "main");
}

#[test]
fn test_spawn_empty_parent_rejected() {
    let env = TestEnv::init();
    let parent = env.tract();
    assert_matches!(
        parent.spawn(SpawnMode::HeadSnapshot, "nothing", None),
        Err(TractError::EmptyTract)
    );
}

#[test]
fn test_collapse_folds_child_back_into_parent() {
    let env = TestEnv::init();
    let parent = env.tract();
    write_user(&parent, "main line of work");
    let child = parent.spawn(SpawnMode::HeadSnapshot, "side quest", None).unwrap();
    write_user(&child, "child finding one");
    write_user(&child, "child finding two");

    env.llm.enqueue("the side quest concluded: both findings hold");
    let summary = parent.collapse(&child, None).unwrap();

    assert!(summary.message().unwrap().starts_with("collapse of tract"));
    assert_eq!(
        parent.head_commit_id().unwrap(),
        Some(summary.id().clone())
    );
    assert!(
        parent
            .compile()
            .unwrap()
            .transcript()
            .contains("the side quest concluded")
    );
    // The resolver saw the child's full compiled context.
    let (messages, _) = env.llm.last_call().unwrap();
    assert!(messages[1].content.contains("child finding two"));
}

#[test]
fn test_collapse_of_unrelated_tract_rejected() {
    let env = TestEnv::init();
    let parent = env.tract();
    write_user(&parent, "base");
    let stranger = env.workspace.create_tract("stranger").unwrap();
    write_user(&stranger, "unrelated");

    assert_matches!(
        parent.collapse(&stranger, None),
        Err(TractError::NotSpawnRelated { .. })
    );
}

#[test]
fn test_collapse_through_spawn_chain() {
    let env = TestEnv::init();
    let parent = env.tract();
    write_user(&parent, "top");
    let child = parent.spawn(SpawnMode::HeadSnapshot, "mid", None).unwrap();
    let grandchild = child.spawn(SpawnMode::HeadSnapshot, "leaf", None).unwrap();
    write_user(&grandchild, "deep result");

    // The grandchild descends from the parent through the spawn graph.
    env.llm.enqueue("deep summary");
    let summary = parent.collapse(&grandchild, None).unwrap();
    assert!(summary.payload().unwrap().prompt_text().contains("deep summary"));
}
