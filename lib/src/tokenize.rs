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

//! The tokenizer capability. Implementations bind to a model family; an
//! authoritative count from a provider response overrides the estimate for
//! the commit it produced.

use std::fmt::Debug;

use crate::content::Payload;

pub trait Tokenizer: Debug {
    /// Identifies the tokenizer (and thus the model family it estimates
    /// for). Part of the compile cache fingerprint.
    fn name(&self) -> &str;

    /// Token count of a text fragment. Never negative by construction.
    fn count(&self, text: &str) -> u64;

    /// Token count of a payload as the compiler would render it. Markers
    /// render to nothing and count zero.
    fn count_payload(&self, payload: &Payload) -> u64 {
        self.count(&payload.prompt_text())
    }
}

/// Bytes-per-token estimator, the usual stand-in when no model-specific
/// tokenizer is wired up.
#[derive(Debug)]
pub struct CharEstimator {
    name: String,
    chars_per_token: usize,
}

impl CharEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        assert!(chars_per_token > 0);
        Self {
            name: format!("chars/{chars_per_token}"),
            chars_per_token,
        }
    }
}

impl Default for CharEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl Tokenizer for CharEstimator {
    fn name(&self) -> &str {
        &self.name
    }

    fn count(&self, text: &str) -> u64 {
        text.chars().count().div_ceil(self.chars_per_token) as u64
    }
}
