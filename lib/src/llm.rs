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

//! The model resolver capability and retry plumbing. The engine never talks
//! HTTP itself; compress, collapse, semantic merge, and generate all go
//! through the injected [`LlmClient`].

use std::fmt::Debug;
use std::time::Duration;

use rand::Rng as _;
use thiserror::Error;
use tracing::debug;

use crate::commit::GenerationUsage;
use crate::compile::Message;
use crate::config::LlmConfig;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatResponse {
    pub text: String,
    pub usage: Option<GenerationUsage>,
    pub model: Option<String>,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Model transport failure")]
    Transport {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Model rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Model rejected the request: {message}")]
    Rejected { message: String },
}

impl LlmError {
    /// Transient failures are retried with backoff; rejections are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::RateLimited { .. } => true,
            Self::Rejected { .. } => false,
        }
    }
}

pub type LlmResult<T> = Result<T, LlmError>;

/// The resolver contract: one blocking chat round. Long calls honor the
/// caller's timeout inside the implementation and surface
/// [`LlmError::Transport`] on expiry.
pub trait LlmClient: Debug {
    fn chat(&self, messages: &[Message], config: &LlmConfig) -> LlmResult<ChatResponse>;
}

/// Bounded exponential backoff with jitter for transient transport failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): exponential growth
    /// capped at `max_delay`, with up to 25% random jitter added.
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);
        let jitter_budget = exp.as_millis() as u64 / 4;
        let jitter = if jitter_budget == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_budget)
        };
        exp + Duration::from_millis(jitter)
    }
}

/// Sends one chat round, retrying transient failures up to the policy's
/// bound. A rate-limit hint from the provider overrides the computed delay.
pub fn chat_with_retry(
    client: &dyn LlmClient,
    messages: &[Message],
    config: &LlmConfig,
    policy: &RetryPolicy,
) -> LlmResult<ChatResponse> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match client.chat(messages, config) {
            Ok(response) => return Ok(response),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = match &err {
                    LlmError::RateLimited {
                        retry_after: Some(hint),
                    } => (*hint).min(policy.max_delay),
                    _ => policy.delay(attempt),
                };
                debug!(attempt, ?delay, error = %err, "retrying model call");
                std::thread::sleep(delay);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::cell::RefCell;

    use assert_matches::assert_matches;

    use super::*;

    #[derive(Debug)]
    struct FlakyClient {
        failures_left: Cell<u32>,
        calls: Cell<u32>,
        terminal: RefCell<Option<LlmError>>,
    }

    impl FlakyClient {
        fn failing(n: u32) -> Self {
            Self {
                failures_left: Cell::new(n),
                calls: Cell::new(0),
                terminal: RefCell::new(None),
            }
        }
    }

    impl LlmClient for FlakyClient {
        fn chat(&self, _messages: &[Message], _config: &LlmConfig) -> LlmResult<ChatResponse> {
            self.calls.set(self.calls.get() + 1);
            if let Some(err) = self.terminal.borrow_mut().take() {
                return Err(err);
            }
            if self.failures_left.get() > 0 {
                self.failures_left.set(self.failures_left.get() - 1);
                return Err(LlmError::Transport {
                    source: "connection reset".into(),
                });
            }
            Ok(ChatResponse {
                text: "ok".to_string(),
                usage: None,
                model: None,
            })
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_retry_recovers_from_transient_failures() {
        let client = FlakyClient::failing(2);
        let response =
            chat_with_retry(&client, &[], &LlmConfig::default(), &fast_policy()).unwrap();
        assert_eq!(response.text, "ok");
        assert_eq!(client.calls.get(), 3);
    }

    #[test]
    fn test_retry_exhaustion_propagates_underlying_error() {
        let client = FlakyClient::failing(10);
        let err = chat_with_retry(&client, &[], &LlmConfig::default(), &fast_policy());
        assert_matches!(err, Err(LlmError::Transport { .. }));
        assert_eq!(client.calls.get(), 3);
    }

    #[test]
    fn test_rejection_is_not_retried() {
        let client = FlakyClient::failing(0);
        *client.terminal.borrow_mut() = Some(LlmError::Rejected {
            message: "content policy".to_string(),
        });
        let err = chat_with_retry(&client, &[], &LlmConfig::default(), &fast_policy());
        assert_matches!(err, Err(LlmError::Rejected { .. }));
        assert_eq!(client.calls.get(), 1);
    }

    #[test]
    fn test_delay_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        // Cap plus at most 25% jitter.
        assert!(policy.delay(8) <= Duration::from_millis(375));
    }
}
