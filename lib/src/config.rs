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

//! Model-call configuration bundles and their layering.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Hyperparameters for one model call. Every field is optional; unset fields
/// fall through to the next layer in the resolution order
/// (per-call override > per-operation default > handle default).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Provider-specific fields, passed through verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl LlmConfig {
    pub fn with_model(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Self::default()
        }
    }

    /// Returns `self` layered over `base`: set fields of `self` win, unset
    /// fields are taken from `base`. `extra` is merged key-wise.
    pub fn merged_over(&self, base: &Self) -> Self {
        let mut extra = base.extra.clone();
        extra.extend(self.extra.clone());
        Self {
            model: self.model.clone().or_else(|| base.model.clone()),
            temperature: self.temperature.or(base.temperature),
            top_p: self.top_p.or(base.top_p),
            top_k: self.top_k.or(base.top_k),
            max_tokens: self.max_tokens.or(base.max_tokens),
            stop_sequences: if self.stop_sequences.is_empty() {
                base.stop_sequences.clone()
            } else {
                self.stop_sequences.clone()
            },
            frequency_penalty: self.frequency_penalty.or(base.frequency_penalty),
            presence_penalty: self.presence_penalty.or(base.presence_penalty),
            seed: self.seed.or(base.seed),
            extra,
        }
    }
}

/// Per-operation config defaults, layered over a handle-wide default.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OperationConfigs {
    pub default: LlmConfig,
    pub chat: LlmConfig,
    pub merge: LlmConfig,
    pub compress: LlmConfig,
    pub collapse: LlmConfig,
}

impl OperationConfigs {
    /// Resolves the effective config for an operation:
    /// `override > operation default > handle default`.
    pub fn resolve(&self, operation: &LlmConfig, override_config: Option<&LlmConfig>) -> LlmConfig {
        let base = operation.merged_over(&self.default);
        match override_config {
            Some(config) => config.merged_over(&base),
            None => base,
        }
    }
}
