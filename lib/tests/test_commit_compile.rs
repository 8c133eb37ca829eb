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
use testutils::write_system;
use testutils::write_user;
use tract_lib::commit::CommitOp;
use tract_lib::compile::MessageRole;
use tract_lib::content::DialogueRole;
use tract_lib::content::Payload;
use tract_lib::hooks::HookVerdict;
use tract_lib::tract::ResetMode;
use tract_lib::tract::TractError;

#[test]
fn test_commit_compile_reset() {
    let env = TestEnv::init();
    let tract = env.tract();

    let first = write_system(&tract, "You are helpful.");
    write_user(&tract, "Hi");
    write_assistant(&tract, "Hello");

    let compiled = tract.compile().unwrap();
    assert_eq!(
        compiled.messages.iter().map(|m| m.role).collect::<Vec<_>>(),
        vec![MessageRole::System, MessageRole::User, MessageRole::Assistant]
    );
    assert_eq!(
        compiled
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>(),
        vec!["You are helpful.", "Hi", "Hello"]
    );
    // Word tokenizer: 3 + 1 + 1.
    assert_eq!(compiled.token_count, 5);
    assert_eq!(
        compiled.token_count,
        compiled.messages.iter().map(|m| m.tokens).sum::<u64>()
    );

    tract.reset(first.id(), ResetMode::Hard).unwrap();
    let compiled = tract.compile().unwrap();
    assert_eq!(compiled.messages.len(), 1);
    assert_eq!(compiled.messages[0].role, MessageRole::System);
}

#[test]
fn test_empty_tract_compiles_to_nothing() {
    let env = TestEnv::init();
    let tract = env.tract();
    let compiled = tract.compile().unwrap();
    assert!(compiled.messages.is_empty());
    assert_eq!(compiled.token_count, 0);
    assert_eq!(compiled.head, None);
}

#[test]
fn test_edit_override_end_to_end() {
    let env = TestEnv::init();
    let tract = env.tract();

    write_user(&tract, "What is Python?");
    let answer = write_assistant(&tract, "A library.");
    tract
        .commit(
            Payload::dialogue(DialogueRole::Assistant, "A programming language."),
            CommitOp::Edit,
            Some(answer.id().clone()),
            None,
        )
        .unwrap();

    let compiled = tract.compile().unwrap();
    assert_eq!(compiled.messages.len(), 2);
    assert_eq!(compiled.messages[0].content, "What is Python?");
    assert_eq!(compiled.messages[1].content, "A programming language.");
    assert!(!compiled.transcript().contains("A library."));
}

#[test]
fn test_commit_validation() {
    let env = TestEnv::init();
    let tract = env.tract();
    let commit = write_user(&tract, "hello there");

    // APPEND with a target and EDIT without one are both rejected.
    assert_matches!(
        tract.commit(
            Payload::dialogue(DialogueRole::User, "x"),
            CommitOp::Append,
            Some(commit.id().clone()),
            None,
        ),
        Err(TractError::EditTargetMismatch)
    );
    assert_matches!(
        tract.commit(
            Payload::dialogue(DialogueRole::User, "x"),
            CommitOp::Edit,
            None,
            None,
        ),
        Err(TractError::EditTargetMismatch)
    );

    // An edit target from another tract's history is unreachable.
    let other = env.tract();
    let foreign = write_user(&other, "foreign");
    assert_matches!(
        tract.commit(
            Payload::dialogue(DialogueRole::User, "x"),
            CommitOp::Edit,
            Some(foreign.id().clone()),
            None,
        ),
        Err(TractError::InvalidEditTarget(_))
    );
}

#[test]
fn test_detached_head_rejects_commit_but_compiles() {
    let env = TestEnv::init();
    let tract = env.tract();
    let first = write_user(&tract, "one");
    write_user(&tract, "two");

    tract.checkout(first.id()).unwrap();
    let compiled = tract.compile().unwrap();
    assert_eq!(compiled.messages.len(), 1);

    assert_matches!(
        tract.append(Payload::dialogue(DialogueRole::User, "three")),
        Err(TractError::DetachedHead)
    );
    assert_matches!(tract.generate(None), Err(TractError::DetachedHead));

    // Reattaching restores the full branch.
    tract.switch("main").unwrap();
    assert_eq!(tract.compile().unwrap().messages.len(), 2);
}

#[test]
fn test_commit_token_count_and_auto_message() {
    let env = TestEnv::init();
    let tract = env.tract();
    let commit = write_user(&tract, "four words right here");
    assert_eq!(commit.token_count(), 4);
    assert_eq!(commit.message(), Some("dialogue: four words right here"));
}

#[test]
fn test_commit_hook_reject_and_modify() {
    let env = TestEnv::init();
    let tract = env.tract();

    tract.hooks().register("commit", |_, plan| {
        if plan["message"].as_str().unwrap_or_default().contains("secret") {
            HookVerdict::Reject {
                reason: "no secrets".to_string(),
            }
        } else {
            HookVerdict::Modify(serde_json::json!({"message": "policy message"}))
        }
    });

    let err = tract.commit(
        Payload::dialogue(DialogueRole::User, "hello"),
        CommitOp::Append,
        None,
        Some("a secret note".to_string()),
    );
    assert_matches!(err, Err(TractError::HookRejected { operation: "commit", .. }));
    assert_eq!(tract.head_commit_id().unwrap(), None);

    let commit = write_user(&tract, "fine");
    assert_eq!(commit.message(), Some("policy message"));
}

#[test]
fn test_generate_records_compile_and_usage() {
    let env = TestEnv::init();
    let tract = env.tract();
    write_system(&tract, "You are helpful.");
    write_user(&tract, "Say hi");

    env.llm.enqueue_with_usage("Hi there, friend!", 5, 42);
    let reply = tract.generate(None).unwrap();

    // The provider's completion count overrides the tokenizer estimate.
    assert_eq!(reply.token_count(), 42);
    assert_eq!(reply.usage().unwrap().completion_tokens, 42);
    assert!(reply.generation_config().is_some());

    // Generation compiled through a recording path.
    let record = tract
        .store()
        .latest_compile_record(tract.id())
        .unwrap()
        .unwrap();
    assert_eq!(record.triggered_by.as_deref(), Some("generate"));
    assert_eq!(record.effective.len(), 2);

    // The reply landed on the branch.
    let compiled = tract.compile().unwrap();
    assert_eq!(compiled.messages.last().unwrap().content, "Hi there, friend!");

    // What the model was sent is exactly what the record describes.
    let (messages, _config) = env.llm.last_call().unwrap();
    assert_eq!(messages.len(), 2);
}

#[test]
fn test_chat_appends_user_then_reply() {
    let env = TestEnv::init();
    let tract = env.tract();
    write_system(&tract, "Echo bot.");

    env.llm.enqueue("echo: hello");
    tract.chat("hello", None).unwrap();

    let compiled = tract.compile().unwrap();
    assert_eq!(
        compiled
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>(),
        vec!["Echo bot.", "hello", "echo: hello"]
    );
}

#[test]
fn test_compile_cache_verify_mode() {
    let env = TestEnv::init();
    let tract = env.tract();
    tract.set_verify_cache(true);

    write_user(&tract, "alpha");
    let first = tract.compile().unwrap();
    // Hit the cache; verify mode recomputes and asserts equality.
    let second = tract.compile().unwrap();
    assert_eq!(*first, *second);

    // Annotation mutations change the fingerprint, so the next compile is a
    // miss with the new overlay applied.
    let head = tract.head_commit_id().unwrap().unwrap();
    tract.skip(&head, None).unwrap();
    let third = tract.compile().unwrap();
    assert!(third.messages.is_empty());
}

#[test]
fn test_annotation_round_trip_and_history() {
    let env = TestEnv::init();
    let tract = env.tract();
    let commit = write_user(&tract, "keep me around");

    tract.pin(commit.id(), Some("important")).unwrap();
    assert_eq!(
        tract.priority_of(commit.id()).unwrap(),
        tract_lib::annotate::Priority::Pinned
    );
    tract.unannotate(commit.id()).unwrap();
    assert_eq!(
        tract.priority_of(commit.id()).unwrap(),
        tract_lib::annotate::Priority::Normal
    );
    // Re-annotation is additive; history preserves both entries.
    assert_eq!(tract.annotation_history(commit.id()).unwrap().len(), 2);
    assert!(tract.annotations().unwrap().is_empty());
}
