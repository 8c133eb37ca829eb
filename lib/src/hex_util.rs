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

//! Hex string helpers.

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decodes an even-length hex string to bytes.
pub fn decode_hex(hex: impl AsRef<[u8]>) -> Option<Vec<u8>> {
    let hex = hex.as_ref();
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut decoded = Vec::with_capacity(hex.len() / 2);
    for chunk in hex.chunks_exact(2) {
        let [hi, lo] = chunk.try_into().unwrap();
        decoded.push(hex_value(hi)? << 4 | hex_value(lo)?);
    }
    Some(decoded)
}

/// Encodes `data` as a lowercase hex string.
pub fn encode_hex(data: &[u8]) -> String {
    let encoded = data
        .iter()
        .flat_map(|b| [HEX_CHARS[usize::from(b >> 4)], HEX_CHARS[usize::from(b & 0xf)]])
        .collect();
    String::from_utf8(encoded).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        // Empty string
        assert_eq!(decode_hex(""), Some(vec![]));
        assert_eq!(encode_hex(b""), "".to_string());

        // Odd length
        assert_eq!(decode_hex("abc"), None);

        // All digits
        assert_eq!(
            decode_hex("0123456789abcdef"),
            Some(b"\x01\x23\x45\x67\x89\xab\xcd\xef".to_vec())
        );
        assert_eq!(
            decode_hex("0123456789ABCDEF"),
            Some(b"\x01\x23\x45\x67\x89\xab\xcd\xef".to_vec())
        );
        assert_eq!(
            encode_hex(b"\x01\x23\x45\x67\x89\xab\xcd\xef"),
            "0123456789abcdef".to_string()
        );

        // Invalid digit
        assert_eq!(decode_hex("zz"), None);
    }
}
