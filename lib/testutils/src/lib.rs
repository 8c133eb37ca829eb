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

#![expect(missing_docs)]

//! Test fixtures for `tract-lib`: a workspace over a temporary store, a
//! deterministic tokenizer, and a scripted model client.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;

use tract_lib::commit::Commit;
use tract_lib::commit::GenerationUsage;
use tract_lib::compile::Message;
use tract_lib::compile::RoleCompiler;
use tract_lib::config::LlmConfig;
use tract_lib::content::DialogueRole;
use tract_lib::content::Payload;
use tract_lib::llm::ChatResponse;
use tract_lib::llm::LlmClient;
use tract_lib::llm::LlmError;
use tract_lib::llm::LlmResult;
use tract_lib::tokenize::Tokenizer;
use tract_lib::tract::Capabilities;
use tract_lib::tract::Tract;
use tract_lib::workspace::Workspace;

/// Counts whitespace-separated words. Deterministic and easy to reason
/// about in assertions.
#[derive(Debug)]
pub struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn name(&self) -> &str {
        "words"
    }

    fn count(&self, text: &str) -> u64 {
        text.split_whitespace().count() as u64
    }
}

/// A model client that replays scripted responses and records every call it
/// receives. With an empty script it answers `"summary."`.
#[derive(Debug, Default)]
pub struct ScriptedLlm {
    responses: RefCell<VecDeque<ChatResponse>>,
    calls: RefCell<Vec<(Vec<Message>, LlmConfig)>>,
    fail_with_rejection: RefCell<Option<String>>,
}

impl ScriptedLlm {
    pub fn enqueue(&self, text: impl Into<String>) {
        self.responses.borrow_mut().push_back(ChatResponse {
            text: text.into(),
            usage: None,
            model: Some("scripted".to_string()),
        });
    }

    pub fn enqueue_with_usage(
        &self,
        text: impl Into<String>,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) {
        self.responses.borrow_mut().push_back(ChatResponse {
            text: text.into(),
            usage: Some(GenerationUsage {
                prompt_tokens,
                completion_tokens,
            }),
            model: Some("scripted".to_string()),
        });
    }

    /// The next call fails with a non-retryable rejection.
    pub fn reject_next(&self, message: impl Into<String>) {
        *self.fail_with_rejection.borrow_mut() = Some(message.into());
    }

    pub fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }

    pub fn last_call(&self) -> Option<(Vec<Message>, LlmConfig)> {
        self.calls.borrow().last().cloned()
    }
}

impl LlmClient for ScriptedLlm {
    fn chat(&self, messages: &[Message], config: &LlmConfig) -> LlmResult<ChatResponse> {
        self.calls
            .borrow_mut()
            .push((messages.to_vec(), config.clone()));
        if let Some(message) = self.fail_with_rejection.borrow_mut().take() {
            return Err(LlmError::Rejected { message });
        }
        Ok(self
            .responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| ChatResponse {
                text: "summary.".to_string(),
                usage: None,
                model: Some("scripted".to_string()),
            }))
    }
}

/// A workspace over a temporary store file, with the scripted client kept
/// reachable for assertions.
pub struct TestEnv {
    _temp: tempfile::TempDir,
    pub workspace: Workspace,
    pub llm: Arc<ScriptedLlm>,
}

impl TestEnv {
    pub fn init() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let llm = Arc::new(ScriptedLlm::default());
        let capabilities = Capabilities {
            tokenizer: Arc::new(WordTokenizer),
            llm: llm.clone(),
            compiler: Arc::new(RoleCompiler),
        };
        let workspace =
            Workspace::open(&temp.path().join("store.db"), capabilities).unwrap();
        Self {
            _temp: temp,
            workspace,
            llm,
        }
    }

    /// A fresh tract named `test`.
    pub fn tract(&self) -> Tract {
        self.workspace.create_tract("test").unwrap()
    }
}

pub fn write_system(tract: &Tract, text: &str) -> Commit {
    tract
        .append(Payload::dialogue(DialogueRole::System, text))
        .unwrap()
}

pub fn write_user(tract: &Tract, text: &str) -> Commit {
    tract
        .append(Payload::dialogue(DialogueRole::User, text))
        .unwrap()
}

pub fn write_assistant(tract: &Tract, text: &str) -> Commit {
    tract
        .append(Payload::dialogue(DialogueRole::Assistant, text))
        .unwrap()
}
