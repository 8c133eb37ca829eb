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
use tract_lib::op_store::EventKind;
use tract_lib::store::Head;
use tract_lib::tract::ResetMode;
use tract_lib::tract::TractError;

#[test]
fn test_branch_and_switch_round_trip() {
    let env = TestEnv::init();
    let tract = env.tract();
    let head = write_user(&tract, "base");

    tract.branch("exp").unwrap();
    let before = tract.head_commit_id().unwrap();
    tract.switch("exp").unwrap();
    tract.switch("main").unwrap();

    // Switching away and back leaves the head unchanged; the ref set gained
    // exactly the new branch.
    assert_eq!(tract.head_commit_id().unwrap(), before);
    assert_eq!(
        tract.list_branches().unwrap(),
        vec![
            ("exp".to_string(), head.id().clone()),
            ("main".to_string(), head.id().clone()),
        ]
    );

    assert_matches!(
        tract.branch("exp"),
        Err(TractError::BranchExists(name)) if name == "exp"
    );
    assert_matches!(
        tract.switch("nope"),
        Err(TractError::UnknownBranch(name)) if name == "nope"
    );
}

#[test]
fn test_delete_branch_rules() {
    let env = TestEnv::init();
    let tract = env.tract();
    write_user(&tract, "base");
    tract.branch("scratch").unwrap();

    assert_matches!(
        tract.delete_branch("main"),
        Err(TractError::DeleteCurrentBranch(name)) if name == "main"
    );
    tract.delete_branch("scratch").unwrap();
    assert_matches!(
        tract.delete_branch("scratch"),
        Err(TractError::UnknownBranch(_))
    );
    assert_eq!(tract.list_branches().unwrap().len(), 1);
}

#[test]
fn test_reset_soft_keeps_forward_commits_in_provenance() {
    let env = TestEnv::init();
    let tract = env.tract();
    let target = write_user(&tract, "keep this");
    let forward1 = write_user(&tract, "drop one");
    let forward2 = write_user(&tract, "drop two");

    tract.reset(target.id(), ResetMode::Soft).unwrap();
    assert_eq!(tract.head_commit_id().unwrap(), Some(target.id().clone()));

    // The abandoned commits are recorded in a reorganize event, in order.
    let events = tract.store().events_for_source(forward1.id()).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Reorganize);
    assert_eq!(
        events[0].sources,
        vec![forward1.id().clone(), forward2.id().clone()]
    );

    // Reset soft then commit behaves like committing from the target.
    let next = write_user(&tract, "new tip");
    assert_eq!(next.parent_ids(), &[target.id().clone()]);
}

#[test]
fn test_reset_hard_records_nothing() {
    let env = TestEnv::init();
    let tract = env.tract();
    let target = write_user(&tract, "keep");
    let forward = write_user(&tract, "gone");

    tract.reset(target.id(), ResetMode::Hard).unwrap();
    assert!(tract.store().events_for_source(forward.id()).unwrap().is_empty());
    // The commit object itself still exists until GC runs.
    assert!(tract.store().commit_exists(forward.id()).unwrap());
}

#[test]
fn test_reset_rejects_non_ancestor() {
    let env = TestEnv::init();
    let tract = env.tract();
    write_user(&tract, "base");
    tract.branch("side").unwrap();
    tract.switch("side").unwrap();
    let side_tip = write_user(&tract, "side work");
    tract.switch("main").unwrap();
    write_user(&tract, "main work");

    assert_matches!(
        tract.reset(side_tip.id(), ResetMode::Soft),
        Err(TractError::NotAnAncestor(_))
    );
}

#[test]
fn test_checkout_detaches_and_head_reports_it() {
    let env = TestEnv::init();
    let tract = env.tract();
    let first = write_user(&tract, "one");
    write_user(&tract, "two");

    tract.checkout(first.id()).unwrap();
    assert_eq!(
        tract.head().unwrap(),
        Head::Detached {
            commit: first.id().clone()
        }
    );
    assert_matches!(tract.current_branch(), Err(TractError::DetachedHead));
}

#[test]
fn test_log_and_stats() {
    let env = TestEnv::init();
    let tract = env.tract();
    write_user(&tract, "one word counts");
    write_user(&tract, "two");
    write_user(&tract, "three");

    let log = tract.log(None).unwrap();
    assert_eq!(log.len(), 3);
    // Newest first.
    assert_eq!(log[0].message(), Some("dialogue: three"));
    assert_eq!(tract.log(Some(2)).unwrap().len(), 2);

    let (commits, tokens) = tract.stats().unwrap();
    assert_eq!(commits, 3);
    assert_eq!(tokens, 5);
}

#[test]
fn test_workspace_tract_registry() {
    let env = TestEnv::init();
    let a = env.tract();
    let b = env.workspace.create_tract("second").unwrap();
    write_user(&a, "in a");

    let listed = env.workspace.list_tracts().unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[1].name, "second");

    let reopened = env.workspace.open_tract(b.id()).unwrap();
    assert_eq!(reopened.head_commit_id().unwrap(), None);

    // Commits are scoped by tract.
    assert_eq!(b.stats().unwrap().0, 0);
    assert_eq!(a.stats().unwrap().0, 1);
}
