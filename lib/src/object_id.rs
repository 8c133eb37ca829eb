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

#![expect(missing_docs)]

pub trait ObjectId {
    fn object_type(&self) -> String;
    fn as_bytes(&self) -> &[u8];
    fn to_bytes(&self) -> Vec<u8>;
    fn hex(&self) -> String;
}

// Defines a new struct type with visibility `vis` and name `ident` containing
// a single Vec<u8> used to store an identifier (typically the output of a hash
// function) as bytes. Types defined using this macro automatically implement
// the `ObjectId` trait.
// Documentation comments written inside the macro definition will be captured
// and associated with the type defined by the macro.
macro_rules! id_type {
    (   $(#[$attr:meta])*
        $vis:vis $name:ident
    ) => {
        $(#[$attr])*
        #[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
        $vis struct $name(Vec<u8>);
        $crate::object_id::impl_id_type!($name);
    };
}

macro_rules! impl_id_type {
    ($name:ident) => {
        #[allow(dead_code)]
        impl $name {
            pub fn new(value: Vec<u8>) -> Self {
                Self(value)
            }

            pub fn from_bytes(bytes: &[u8]) -> Self {
                Self(bytes.to_vec())
            }

            /// Parses the given hex string into an ObjectId.
            ///
            /// The given string must be valid. A static str is required to
            /// prevent API misuse.
            pub fn from_hex(hex: &'static str) -> Self {
                Self::try_from_hex(hex).unwrap()
            }

            /// Parses the given hex string into an ObjectId.
            pub fn try_from_hex(hex: impl AsRef<[u8]>) -> Option<Self> {
                $crate::hex_util::decode_hex(hex).map(Self)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
                f.debug_tuple(stringify!($name)).field(&self.hex()).finish()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
                f.pad(&self.hex())
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                if serializer.is_human_readable() {
                    self.hex().serialize(serializer)
                } else {
                    self.as_bytes().serialize(serializer)
                }
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                if deserializer.is_human_readable() {
                    let hex = String::deserialize(deserializer)?;
                    Self::try_from_hex(&hex).ok_or_else(|| {
                        serde::de::Error::custom(format!("invalid hex id: {hex}"))
                    })
                } else {
                    Vec::<u8>::deserialize(deserializer).map(Self)
                }
            }
        }

        impl crate::object_id::ObjectId for $name {
            fn object_type(&self) -> String {
                stringify!($name)
                    .strip_suffix("Id")
                    .unwrap()
                    .to_ascii_lowercase()
                    .to_string()
            }

            fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            fn to_bytes(&self) -> Vec<u8> {
                self.0.clone()
            }

            fn hex(&self) -> String {
                $crate::hex_util::encode_hex(&self.0)
            }
        }
    };
}

pub(crate) use id_type;
pub(crate) use impl_id_type;

id_type!(
    /// Identifier for a commit, the SHA-256 over its canonical record bytes.
    /// Rewriting any field of a commit produces a new `CommitId`.
    pub CommitId
);
id_type!(
    /// Identifier for a content blob, the SHA-256 of its canonical payload
    /// bytes. Identical payloads share one `ContentId` across all tracts.
    pub ContentId
);
id_type!(
    /// Stable 128-bit identifier for a tract.
    pub TractId
);

impl TractId {
    /// Generates a fresh random tract id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_object_id() {
        let commit_id = CommitId::from_hex("deadbeef0123");
        assert_eq!(format!("{commit_id}"), "deadbeef0123");
        assert_eq!(format!("{commit_id:.6}"), "deadbe");
        assert_eq!(format!("{commit_id:?}"), r#"CommitId("deadbeef0123")"#);
    }

    #[test]
    fn test_object_type() {
        assert_eq!(CommitId::from_hex("ab").object_type(), "commit");
        assert_eq!(ContentId::from_hex("ab").object_type(), "content");
    }

    #[test]
    fn test_tract_id_random() {
        let a = TractId::random();
        let b = TractId::random();
        assert_eq!(a.as_bytes().len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn test_serde_human_readable() {
        let id = CommitId::from_hex("00ff");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#""00ff""#);
        let back: CommitId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
