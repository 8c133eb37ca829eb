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
use testutils::write_user;
use tract_lib::commit::CommitOp;
use tract_lib::content::DialogueRole;
use tract_lib::content::Payload;
use tract_lib::op_store::EventKind;
use tract_lib::rewrite::RewriteWarning;
use tract_lib::tract::TractError;

#[test]
fn test_rebase_replays_and_records_reorganize() {
    let env = TestEnv::init();
    let tract = env.tract();
    write_user(&tract, "B0");
    tract.branch("feat").unwrap();
    tract.switch("feat").unwrap();
    let f1 = write_user(&tract, "F1");
    let f2 = write_user(&tract, "F2");
    tract.switch("main").unwrap();
    let b1 = write_user(&tract, "B1");

    let outcome = tract.rebase(Some("feat"), "main").unwrap();
    assert_eq!(outcome.branch, "feat");
    assert_eq!(outcome.new_commits.len(), 2);
    assert!(outcome.warnings.is_empty());

    // New hashes, old commits still in the DAG.
    assert_ne!(outcome.new_commits[0], *f1.id());
    assert_ne!(outcome.new_commits[1], *f2.id());
    assert!(tract.store().commit_exists(f1.id()).unwrap());

    // Parent chain B1 <- F1' <- F2'.
    let f1_new = tract.store().get_commit(&outcome.new_commits[0]).unwrap();
    let f2_new = tract.store().get_commit(&outcome.new_commits[1]).unwrap();
    assert_eq!(f1_new.parent_ids(), &[b1.id().clone()]);
    assert_eq!(f2_new.parent_ids(), &[outcome.new_commits[0].clone()]);

    // "feat" points at F2'.
    assert_eq!(
        tract.store().branch_target(tract.id(), "feat").unwrap(),
        Some(outcome.new_commits[1].clone())
    );

    // The reorganize event maps old to new by position.
    let event = tract.store().event(outcome.event.unwrap()).unwrap();
    assert_eq!(event.kind, EventKind::Reorganize);
    assert_eq!(event.sources, vec![f1.id().clone(), f2.id().clone()]);
    assert_eq!(event.results, outcome.new_commits);

    // Content is unchanged, so blobs are shared.
    assert_eq!(f1_new.content_id(), f1.content_id());
}

#[test]
fn test_rebase_preserves_edit_target_mapping() {
    let env = TestEnv::init();
    let tract = env.tract();
    write_user(&tract, "B0");
    tract.branch("feat").unwrap();
    tract.switch("feat").unwrap();
    let original = write_user(&tract, "draft answer");
    tract
        .commit(
            Payload::dialogue(DialogueRole::User, "final answer"),
            CommitOp::Edit,
            Some(original.id().clone()),
            None,
        )
        .unwrap();
    tract.switch("main").unwrap();
    write_user(&tract, "B1");

    let outcome = tract.rebase(Some("feat"), "main").unwrap();
    assert!(outcome.warnings.is_empty());

    // The replayed EDIT points at the replayed target, not the old one.
    let replayed_edit = tract.store().get_commit(&outcome.new_commits[1]).unwrap();
    assert_eq!(replayed_edit.op(), CommitOp::Edit);
    assert_eq!(replayed_edit.edit_target(), Some(&outcome.new_commits[0]));

    // Compiling the rebased branch applies the override.
    tract.switch("feat").unwrap();
    let compiled = tract.compile().unwrap();
    assert!(compiled.transcript().contains("final answer"));
    assert!(!compiled.transcript().contains("draft answer"));
}

#[test]
fn test_rebase_of_up_to_date_branch_is_a_no_op() {
    let env = TestEnv::init();
    let tract = env.tract();
    write_user(&tract, "only");
    tract.branch("feat").unwrap();

    let outcome = tract.rebase(Some("feat"), "main").unwrap();
    assert!(outcome.new_commits.is_empty());
    assert!(outcome.event.is_none());
}

#[test]
fn test_import_from_another_tract_records_event() {
    let env = TestEnv::init();
    let source_tract = env.workspace.create_tract("library").unwrap();
    let exported = write_user(&source_tract, "reusable prompt fragment");

    let tract = env.tract();
    write_user(&tract, "local base");

    let outcome = tract.import(exported.id()).unwrap();
    assert_ne!(outcome.commit.id(), exported.id());
    assert_eq!(outcome.commit.tract(), tract.id());
    assert_eq!(outcome.commit.content_id(), exported.content_id());
    assert_eq!(
        tract.head_commit_id().unwrap(),
        Some(outcome.commit.id().clone())
    );

    let event = tract.store().event(outcome.event).unwrap();
    assert_eq!(event.kind, EventKind::Import);
    assert_eq!(event.sources, vec![exported.id().clone()]);
    assert_eq!(event.results, vec![outcome.commit.id().clone()]);
}

#[test]
fn test_import_edit_without_target_is_invariant_error() {
    let env = TestEnv::init();
    let other = env.workspace.create_tract("other").unwrap();
    let target = write_user(&other, "to be edited");
    let edit = other
        .commit(
            Payload::dialogue(DialogueRole::User, "edited"),
            CommitOp::Edit,
            Some(target.id().clone()),
            None,
        )
        .unwrap();

    let tract = env.tract();
    write_user(&tract, "unrelated");
    assert_matches!(
        tract.import(edit.id()),
        Err(TractError::EditBeforeTarget(id)) if id == *target.id()
    );
}

#[test]
fn test_import_flags_broken_tool_chain() {
    let env = TestEnv::init();
    let other = env.workspace.create_tract("other").unwrap();
    // A tool call then its result, committed in the source tract.
    other
        .append(Payload::ToolCall {
            call_id: "call-7".to_string(),
            name: "search".to_string(),
            arguments: serde_json::json!({"q": "rust"}),
        })
        .unwrap();
    let result = other
        .append(Payload::ToolResult {
            call_id: "call-7".to_string(),
            output: "found it".to_string(),
            is_error: false,
        })
        .unwrap();

    // Importing only the result leaves its call behind.
    let tract = env.tract();
    write_user(&tract, "base");
    let outcome = tract.import(result.id()).unwrap();
    assert_eq!(
        outcome.warnings,
        vec![RewriteWarning::BrokenToolChain {
            commit: result.id().clone(),
            call_id: "call-7".to_string(),
        }]
    );
    // A warning, not a failure: the commit landed.
    assert_eq!(
        tract.head_commit_id().unwrap(),
        Some(outcome.commit.id().clone())
    );
}

#[test]
fn test_rebase_requires_known_branches() {
    let env = TestEnv::init();
    let tract = env.tract();
    write_user(&tract, "base");
    assert_matches!(
        tract.rebase(Some("ghost"), "main"),
        Err(TractError::UnknownBranch(name)) if name == "ghost"
    );
    assert_matches!(
        tract.rebase(None, "ghost"),
        Err(TractError::UnknownBranch(name)) if name == "ghost"
    );
}
