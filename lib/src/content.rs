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

//! Content payloads and their canonical, content-addressed serialization.

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest as _;
use sha2::Sha256;

use crate::object_id::ContentId;
use crate::object_id::TractId;

/// Speaker of a [`Payload::Dialogue`] entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogueRole {
    System,
    User,
    Assistant,
}

impl DialogueRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A content payload. The `type` tag is part of the canonical serialization,
/// so two payloads of different variants never share a [`ContentId`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// A role-tagged conversation message.
    Dialogue { role: DialogueRole, text: String },
    /// A standing instruction, rendered as a system message.
    Instruction { text: String },
    /// A tool invocation issued by the model.
    ToolCall {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    /// The result produced for an earlier [`Payload::ToolCall`].
    ToolResult {
        call_id: String,
        output: String,
        is_error: bool,
    },
    /// A session boundary marker. Renders to no messages.
    Session { marker: String },
    /// A marker recording that a child tract was spawned here. Renders to no
    /// messages.
    Spawn { child: TractId, purpose: String },
    /// Untyped text, used for merge and compression outputs.
    Opaque { text: String },
}

impl Payload {
    /// Canonical byte serialization: JSON with all object keys in
    /// lexicographic order at every level. Round-trips through
    /// [`Payload::from_canonical_bytes`]. Inserting a tag or field yields
    /// different bytes, never a silently equal encoding.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        // serde_json's Map is a BTreeMap, so going through Value sorts keys
        // recursively, including inside ToolCall arguments.
        let value = serde_json::to_value(self)?;
        serde_json::to_vec(&value)
    }

    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// The SHA-256 of the canonical bytes.
    pub fn content_id(&self) -> Result<ContentId, serde_json::Error> {
        let bytes = self.canonical_bytes()?;
        Ok(ContentId::new(Sha256::digest(&bytes).to_vec()))
    }

    /// The `type` tag of this payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dialogue { .. } => "dialogue",
            Self::Instruction { .. } => "instruction",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Session { .. } => "session",
            Self::Spawn { .. } => "spawn",
            Self::Opaque { .. } => "opaque",
        }
    }

    /// The text a model would see for this payload. Markers contribute
    /// nothing to the prompt and return an empty string.
    pub fn prompt_text(&self) -> String {
        match self {
            Self::Dialogue { text, .. } => text.clone(),
            Self::Instruction { text } => text.clone(),
            Self::ToolCall {
                call_id,
                name,
                arguments,
            } => {
                format!("[tool call {call_id}] {name}({arguments})")
            }
            Self::ToolResult {
                call_id,
                output,
                is_error,
            } => {
                if *is_error {
                    format!("[tool error {call_id}] {output}")
                } else {
                    format!("[tool result {call_id}] {output}")
                }
            }
            Self::Session { .. } | Self::Spawn { .. } => String::new(),
            Self::Opaque { text } => text.clone(),
        }
    }

    pub fn dialogue(role: DialogueRole, text: impl Into<String>) -> Self {
        Self::Dialogue {
            role,
            text: text.into(),
        }
    }

    pub fn instruction(text: impl Into<String>) -> Self {
        Self::Instruction { text: text.into() }
    }

    pub fn opaque(text: impl Into<String>) -> Self {
        Self::Opaque { text: text.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_bytes_sorted_keys() {
        let payload = Payload::ToolCall {
            call_id: "c1".to_string(),
            name: "search".to_string(),
            arguments: serde_json::json!({"zeta": 1, "alpha": {"nested_z": 2, "nested_a": 3}}),
        };
        let bytes = payload.canonical_bytes().unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        // Keys appear in lexicographic order at every level.
        assert!(text.find(r#""alpha""#).unwrap() < text.find(r#""zeta""#).unwrap());
        assert!(text.find(r#""nested_a""#).unwrap() < text.find(r#""nested_z""#).unwrap());
        assert!(text.find(r#""arguments""#).unwrap() < text.find(r#""call_id""#).unwrap());
    }

    #[test]
    fn test_canonical_round_trip() {
        let payloads = [
            Payload::dialogue(DialogueRole::User, "hi"),
            Payload::instruction("be brief"),
            Payload::ToolResult {
                call_id: "c2".to_string(),
                output: "42".to_string(),
                is_error: false,
            },
            Payload::Session {
                marker: "s1".to_string(),
            },
            Payload::opaque("blob"),
        ];
        for payload in payloads {
            let bytes = payload.canonical_bytes().unwrap();
            let back = Payload::from_canonical_bytes(&bytes).unwrap();
            assert_eq!(back, payload);
            assert_eq!(back.canonical_bytes().unwrap(), bytes);
        }
    }

    #[test]
    fn test_content_id_deterministic() {
        let a = Payload::dialogue(DialogueRole::User, "same");
        let b = Payload::dialogue(DialogueRole::User, "same");
        assert_eq!(a.content_id().unwrap(), b.content_id().unwrap());

        let c = Payload::dialogue(DialogueRole::Assistant, "same");
        assert_ne!(a.content_id().unwrap(), c.content_id().unwrap());

        // Same text under a different tag is different content.
        let d = Payload::opaque("same");
        assert_ne!(a.content_id().unwrap(), d.content_id().unwrap());
    }

    #[test]
    fn test_marker_prompt_text_empty() {
        let session = Payload::Session {
            marker: "boundary".to_string(),
        };
        assert_eq!(session.prompt_text(), "");
        let spawn = Payload::Spawn {
            child: TractId::random(),
            purpose: "research".to_string(),
        };
        assert_eq!(spawn.prompt_text(), "");
    }
}
