// Copyright (C) 2025 Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

/// Bencode codec for nREPL messages
///
/// This module handles encoding and decoding of nREPL values using bencode format.
///
/// Bencode format:
/// - Strings: `<length>:<string>` (e.g., "4:spam")
/// - Integers: `i<number>e` (e.g., "i42e")
/// - Lists: `l<items>e` (e.g., "l4:spam4:eggse")
/// - Dictionaries: `d<key><value>...e` (e.g., "d3:cow3:moo4:spam4:eggse")
///
/// Decoding is incremental: a prefix that could still become a valid value
/// is reported as [`Decoded::Incomplete`], while bytes that can never form a
/// value are a codec error. A value whose bounds are sound but whose content
/// is not (a non-UTF-8 string, an integer like `i-e`) is
/// [`Decoded::Malformed`], so the caller can skip it and carry on.
use crate::error::{NReplError, Result};
use crate::message::{Message, Value};

/// Maximum allowed length for a single bencode string (100MB)
/// This prevents malicious servers from causing OOM by sending extremely large length values
pub const MAX_STRING_LENGTH: usize = 100 * 1024 * 1024;

/// Deepest list/dict nesting accepted before the input is rejected
pub const MAX_NESTING_DEPTH: usize = 64;

/// Longest length prefix accepted before the `:` separator
const MAX_LENGTH_DIGITS: usize = 20;

/// Outcome of a decode attempt against the front of a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// One complete value and the number of bytes it occupied
    Complete { value: Value, consumed: usize },
    /// The buffer holds a valid prefix; more bytes are needed
    Incomplete,
    /// A framed value that does not decode; `consumed` bytes can be skipped
    Malformed { consumed: usize, message: String },
}

pub fn encode(value: &Value) -> Result<Vec<u8>> {
    serde_bencode::to_bytes(value).map_err(|e| NReplError::codec(e.to_string(), 0))
}

pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    serde_bencode::to_bytes(message).map_err(|e| NReplError::codec(e.to_string(), 0))
}

/// Find the end position of the bencode value starting at `start`
///
/// Returns `Ok(None)` when the data ends before the value does. `depth` is
/// the number of containers already open around `start`.
fn find_bencode_end(data: &[u8], start: usize, depth: usize) -> Result<Option<usize>> {
    let mut pos = start;

    if pos >= data.len() {
        return Ok(None);
    }

    if matches!(data[pos], b'l' | b'd') && depth >= MAX_NESTING_DEPTH {
        return Err(NReplError::codec(
            format!("Nesting deeper than {} levels", MAX_NESTING_DEPTH),
            pos,
        ));
    }

    match data[pos] {
        b'i' => {
            // Integer: i<number>e
            pos += 1;
            while pos < data.len() && data[pos] != b'e' {
                if !(data[pos].is_ascii_digit() || data[pos] == b'-') {
                    return Err(NReplError::codec_with_preview(
                        format!("Invalid integer byte: 0x{:02x}", data[pos]),
                        pos,
                        data,
                    ));
                }
                pos += 1;
            }
            if pos >= data.len() {
                return Ok(None);
            }
            Ok(Some(pos + 1))
        }
        b'l' => {
            // List: l<items>e
            pos += 1;
            while pos < data.len() && data[pos] != b'e' {
                match find_bencode_end(data, pos, depth + 1)? {
                    Some(next) => pos = next,
                    None => return Ok(None),
                }
            }
            if pos >= data.len() {
                return Ok(None);
            }
            Ok(Some(pos + 1))
        }
        b'd' => {
            // Dict: d<key><value>...e
            pos += 1;
            while pos < data.len() && data[pos] != b'e' {
                if !data[pos].is_ascii_digit() {
                    return Err(NReplError::codec_with_preview(
                        format!("Dictionary key must be a string, found 0x{:02x}", data[pos]),
                        pos,
                        data,
                    ));
                }
                // key
                match find_bencode_end(data, pos, depth + 1)? {
                    Some(next) => pos = next,
                    None => return Ok(None),
                }
                // value
                match find_bencode_end(data, pos, depth + 1)? {
                    Some(next) => pos = next,
                    None => return Ok(None),
                }
            }
            if pos >= data.len() {
                return Ok(None);
            }
            Ok(Some(pos + 1))
        }
        b'0'..=b'9' => {
            // String: <length>:<data>
            let digits_start = pos;
            while pos < data.len() && data[pos] != b':' {
                if !data[pos].is_ascii_digit() {
                    return Err(NReplError::codec_with_preview(
                        format!("Invalid string length byte: 0x{:02x}", data[pos]),
                        pos,
                        data,
                    ));
                }
                if pos - digits_start >= MAX_LENGTH_DIGITS {
                    return Err(NReplError::codec("Invalid string length value", pos));
                }
                pos += 1;
            }
            if pos >= data.len() {
                return Ok(None);
            }

            let len = std::str::from_utf8(&data[digits_start..pos])
                .map_err(|_| NReplError::codec("Invalid string length encoding", pos))?
                .parse::<usize>()
                .map_err(|_| NReplError::codec("Invalid string length value", pos))?;
            pos += 1; // Skip ':'

            // Check maximum string length to prevent OOM from malicious servers
            if len > MAX_STRING_LENGTH {
                return Err(NReplError::codec(
                    format!(
                        "String length {} exceeds maximum allowed size of {} bytes ({} MB)",
                        len,
                        MAX_STRING_LENGTH,
                        MAX_STRING_LENGTH / (1024 * 1024)
                    ),
                    pos,
                ));
            }

            let end_pos = pos.checked_add(len).ok_or_else(|| {
                NReplError::codec(
                    format!(
                        "String length {} would cause integer overflow at position {}",
                        len, pos
                    ),
                    pos,
                )
            })?;

            if end_pos > data.len() {
                return Ok(None);
            }

            Ok(Some(end_pos))
        }
        _ => Err(NReplError::codec_with_preview(
            format!("Invalid bencode byte: 0x{:02x}", data[pos]),
            pos,
            data,
        )),
    }
}

/// Decode one value from the front of `data`
pub fn decode(data: &[u8]) -> Result<Decoded> {
    let Some(consumed) = find_bencode_end(data, 0, 0)? else {
        return Ok(Decoded::Incomplete);
    };

    match serde_bencode::from_bytes::<Value>(&data[..consumed]) {
        Ok(value) => Ok(Decoded::Complete { value, consumed }),
        Err(e) => Ok(Decoded::Malformed {
            consumed,
            message: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(data: &[u8]) -> (Value, usize) {
        match decode(data).expect("decoding failed") {
            Decoded::Complete { value, consumed } => (value, consumed),
            other => panic!("expected a complete value, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_simple_request() {
        let request = Message::request("clone", "1");

        let encoded = encode_message(&request).expect("encoding failed");

        // Keys are written in sorted order
        assert_eq!(encoded, b"d2:id1:12:op5:clonee");
    }

    #[test]
    fn test_encode_eval_request() {
        let request = Message::request("eval", "msg-123")
            .with("session", "session-456")
            .with("code", "(+ 1 2)");

        let encoded = encode_message(&request).expect("encoding failed");
        let encoded_str = String::from_utf8_lossy(&encoded);

        assert!(encoded_str.contains("4:eval"));
        assert!(encoded_str.contains("7:msg-123"));
        assert!(encoded_str.contains("11:session-456"));
        assert!(encoded_str.contains("7:(+ 1 2)"));
    }

    #[test]
    fn test_decode_response() {
        // {"id": "msg-1", "session": "session-456", "status": ["done"]}
        let bencode = b"d2:id5:msg-17:session11:session-4566:statusl4:doneee";

        let (value, consumed) = complete(bencode);
        let response = Message::try_from(value).expect("not a message");

        assert_eq!(response.id(), Some("msg-1"));
        assert_eq!(response.session(), Some("session-456"));
        assert_eq!(response.statuses(), vec!["done"]);
        assert_eq!(consumed, bencode.len());
    }

    #[test]
    fn test_decode_nested_describe_response() {
        let bencode = b"d2:id1:33:opsd4:evald5:dummyi1eee8:versionsd5:nrepld5:major1:1eee";

        let (value, consumed) = complete(bencode);
        let response = Message::try_from(value).expect("not a message");

        let ops = response.get("ops").and_then(Value::as_dict).expect("ops");
        assert!(ops.contains_key("eval"));
        assert_eq!(consumed, bencode.len());
    }

    #[test]
    fn test_decode_integer_and_negative_integer() {
        assert_eq!(complete(b"i42e"), (Value::Int(42), 4));
        assert_eq!(complete(b"i-7e"), (Value::Int(-7), 4));
    }

    #[test]
    fn test_decode_incomplete_prefixes() {
        for prefix in [
            &b""[..],
            b"d2:id5:msg-1",
            b"4:ao",
            b"12",
            b"l4:aoeu3",
            b"i42",
        ] {
            assert_eq!(
                decode(prefix).expect("prefix is not malformed"),
                Decoded::Incomplete,
                "prefix {:?}",
                String::from_utf8_lossy(prefix)
            );
        }
    }

    #[test]
    fn test_decode_multiple_messages() {
        // Two messages concatenated
        let msg1 = b"d2:id5:msg-16:statusl4:doneee";
        let msg2 = b"d2:id5:msg-26:statusl4:doneee";
        let mut combined = Vec::new();
        combined.extend_from_slice(msg1);
        combined.extend_from_slice(msg2);

        let (first, consumed1) = complete(&combined);
        assert_eq!(Message::try_from(first).expect("message").id(), Some("msg-1"));
        assert_eq!(consumed1, msg1.len());

        let (second, consumed2) = complete(&combined[consumed1..]);
        assert_eq!(Message::try_from(second).expect("message").id(), Some("msg-2"));
        assert_eq!(consumed2, msg2.len());
    }

    #[test]
    fn test_trailing_garbage_is_not_consumed() {
        let mut data = b"5:3.uoe".to_vec();
        data.extend_from_slice(b"x!");

        let (value, consumed) = complete(&data);
        assert_eq!(value, Value::from("3.uoe"));
        assert_eq!(consumed, 7);

        // The rest never decodes to the same value again
        assert!(decode(&data[consumed..]).is_err());
    }

    #[test]
    fn test_dict_with_non_string_key_is_malformed() {
        let result = decode(b"di1e1:ae");
        assert!(matches!(result, Err(NReplError::Codec { .. })));
    }

    #[test]
    fn test_bad_content_reports_frame_length() {
        let mut data = b"d3:out2:\xff\xfee".to_vec();
        let frame_len = data.len();
        data.extend_from_slice(b"2:ok");

        match decode(&data).expect("framing is intact") {
            Decoded::Malformed { consumed, .. } => assert_eq!(consumed, frame_len),
            other => panic!("expected a malformed frame, got {:?}", other),
        }
        assert!(matches!(
            decode(b"i-e").expect("framing is intact"),
            Decoded::Malformed { consumed: 3, .. }
        ));
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let deep = vec![b'l'; 200_000];
        match decode(&deep) {
            Err(NReplError::Codec { message, .. }) => assert!(message.contains("Nesting")),
            other => panic!("expected a codec error, got {:?}", other),
        }

        // Right at the limit is still fine
        let mut nested = vec![b'l'; MAX_NESTING_DEPTH];
        nested.extend(vec![b'e'; MAX_NESTING_DEPTH]);
        assert!(matches!(
            decode(&nested).expect("within the limit"),
            Decoded::Complete { consumed, .. } if consumed == nested.len()
        ));
    }

    #[test]
    fn test_encode_matches_consumed_length() {
        let value = Value::List(vec![Value::from("aoeu"), Value::from("oeu"), Value::Int(3)]);
        let encoded = encode(&value).expect("encoding failed");

        let (decoded, consumed) = complete(&encoded);
        assert_eq!(decoded, value);
        assert_eq!(consumed, encoded.len());
    }
}
