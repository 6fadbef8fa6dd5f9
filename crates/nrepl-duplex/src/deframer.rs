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

//! Streaming reassembly of bencode values from a fragmented byte stream

use crate::codec::{self, Decoded};
use crate::error::{NReplError, Result};
use crate::message::Value;

/// Default ceiling on bytes buffered without completing a value (128MB)
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 128 * 1024 * 1024;

/// Callback invoked for every reassembled value
pub type FrameListener = Box<dyn FnMut(&Value) -> Result<()> + Send>;

/// Buffers raw bytes and emits each complete bencode value exactly once
///
/// Values are emitted in stream order to every listener, in the order the
/// listeners were added. The buffer only ever shrinks by the exact length of
/// a decoded value, so a value split across any number of `push` calls is
/// reassembled once all of its bytes have arrived.
///
/// A framed value whose content does not decode is dropped on its own and
/// reported as a codec error; the values behind it stay buffered for the
/// next [`Deframer::drain`]. A stream that can never decode (a malformed
/// byte, or more than `max_buffered` bytes without a complete value) is
/// reported the same way but the whole buffer is discarded, since framing
/// cannot be recovered.
pub struct Deframer {
    buffer: Vec<u8>,
    listeners: Vec<FrameListener>,
    max_buffered: usize,
}

impl Deframer {
    pub fn new() -> Self {
        Self::with_max_buffered(DEFAULT_MAX_BUFFERED_BYTES)
    }

    pub fn with_max_buffered(max_buffered: usize) -> Self {
        Self {
            buffer: Vec::new(),
            listeners: Vec::new(),
            max_buffered,
        }
    }

    pub fn add_listener(&mut self, listener: impl FnMut(&Value) -> Result<()> + Send + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Number of bytes waiting for the rest of a value
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append `bytes` and emit every value that is now complete
    ///
    /// Returns the number of values emitted. A listener error stops the
    /// current push; bytes that were not yet decoded stay buffered and are
    /// picked up by the next call.
    pub fn push(&mut self, bytes: &[u8]) -> Result<usize> {
        self.buffer.extend_from_slice(bytes);
        self.drain()
    }

    /// Emit every complete value already in the buffer
    pub fn drain(&mut self) -> Result<usize> {
        let mut emitted = 0;

        while let Some(value) = self.next_value()? {
            emitted += 1;
            for listener in self.listeners.iter_mut() {
                listener(&value)?;
            }
        }

        Ok(emitted)
    }

    /// Decode the value at the head of the buffer, if it is complete
    fn next_value(&mut self) -> Result<Option<Value>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match codec::decode(&self.buffer) {
            Ok(Decoded::Complete { value, consumed }) => {
                self.buffer.drain(..consumed);
                Ok(Some(value))
            }
            Ok(Decoded::Incomplete) if self.buffer.len() > self.max_buffered => {
                let buffered = self.buffer.len();
                self.buffer.clear();
                Err(NReplError::codec(
                    format!(
                        "Buffered {} bytes without a complete value (limit {})",
                        buffered, self.max_buffered
                    ),
                    buffered,
                ))
            }
            Ok(Decoded::Incomplete) => Ok(None),
            Ok(Decoded::Malformed { consumed, message }) => {
                let error = NReplError::codec_with_preview(message, 0, &self.buffer[..consumed]);
                self.buffer.drain(..consumed);
                Err(error)
            }
            Err(e) => {
                self.buffer.clear();
                Err(e)
            }
        }
    }
}

impl Default for Deframer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    fn recording_deframer() -> (Deframer, Arc<Mutex<Vec<Value>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let mut deframer = Deframer::new();
        deframer.add_listener(move |value| {
            sink.lock().unwrap().push(value.clone());
            Ok(())
        });
        (deframer, received)
    }

    fn expected_values() -> Vec<Value> {
        vec![
            Value::from("aooe"),
            Value::from("3.uoe"),
            Value::List(vec![Value::from("aoeu"), Value::from("oeu")]),
        ]
    }

    #[test]
    fn test_pushing_fragments() {
        let (mut deframer, received) = recording_deframer();

        deframer.push(b"4:ao").unwrap();
        deframer.push(b"oe").unwrap();
        deframer.push(b"5:3.uoe").unwrap();
        deframer.push(b"l4:aoeu3").unwrap();
        deframer.push(b":oeue").unwrap();

        assert_eq!(*received.lock().unwrap(), expected_values());
        assert_eq!(deframer.buffered(), 0);
    }

    #[test]
    fn test_several_values_in_one_push() {
        let (mut deframer, received) = recording_deframer();

        let emitted = deframer.push(b"12:aoeuaoeuaoeu12:aoeua").unwrap();
        assert_eq!(emitted, 1);
        assert_eq!(deframer.buffered(), 8);

        let emitted = deframer.push(b"oeuaoeu").unwrap();
        assert_eq!(emitted, 1);

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 2);
        assert!(received.iter().all(|v| v == &Value::from("aoeuaoeuaoeu")));
    }

    #[test]
    fn test_incomplete_leaves_buffer_untouched() {
        let (mut deframer, received) = recording_deframer();

        assert_eq!(deframer.push(b"d2:id1:1").unwrap(), 0);
        assert_eq!(deframer.buffered(), 8);
        assert_eq!(deframer.drain().unwrap(), 0);
        assert_eq!(deframer.buffered(), 8);
        assert!(received.lock().unwrap().is_empty());
    }

    #[test]
    fn test_listeners_fan_out_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut deframer = Deframer::new();
        for name in ["first", "second"] {
            let order = Arc::clone(&order);
            deframer.add_listener(move |value| {
                order.lock().unwrap().push(format!("{}:{}", name, value));
                Ok(())
            });
        }

        deframer.push(b"1:a1:b").unwrap();

        assert_eq!(
            *order.lock().unwrap(),
            vec!["first:a", "second:a", "first:b", "second:b"]
        );
    }

    #[test]
    fn test_listener_error_keeps_remaining_bytes() {
        let mut deframer = Deframer::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        deframer.add_listener(move |value| {
            sink.lock().unwrap().push(value.clone());
            if value == &Value::from("bad") {
                Err(NReplError::protocol("rejected"))
            } else {
                Ok(())
            }
        });

        assert!(deframer.push(b"3:bad2:ok").is_err());
        assert_eq!(deframer.buffered(), 4);

        assert_eq!(deframer.drain().unwrap(), 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Value::from("bad"), Value::from("ok")]
        );
    }

    #[test]
    fn test_malformed_stream_is_reported_and_discarded() {
        let (mut deframer, received) = recording_deframer();

        let result = deframer.push(b"4:aooex123");
        assert!(matches!(result, Err(NReplError::Codec { .. })));
        assert_eq!(*received.lock().unwrap(), vec![Value::from("aooe")]);
        assert_eq!(deframer.buffered(), 0);

        // The deframer keeps working on fresh input
        deframer.push(b"2:ok").unwrap();
        assert_eq!(received.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_undecodable_frame_is_skipped_alone() {
        let (mut deframer, received) = recording_deframer();

        let mut bytes = b"d3:out2:\xff\xfee".to_vec();
        bytes.extend_from_slice(b"d2:id1:75:value2:oke");
        let result = deframer.push(&bytes);

        assert!(matches!(result, Err(NReplError::Codec { .. })));
        assert_eq!(deframer.buffered(), 20);
        assert_eq!(deframer.drain().unwrap(), 1);

        let received = received.lock().unwrap();
        let reply = received[0].as_dict().expect("a dict");
        assert_eq!(reply.get("id"), Some(&Value::from("7")));
        assert_eq!(reply.get("value"), Some(&Value::from("ok")));
        assert_eq!(deframer.buffered(), 0);
    }

    #[test]
    fn test_buffer_limit_declares_stream_corrupt() {
        let mut deframer = Deframer::with_max_buffered(16);

        // A string that claims more bytes than will ever be allowed to buffer
        let result = deframer.push(b"64:0123456789abcdef0123");
        assert!(matches!(result, Err(NReplError::Codec { .. })));
        assert_eq!(deframer.buffered(), 0);
    }

    proptest! {
        #[test]
        fn prop_fragmented_reassembly(cuts in proptest::collection::vec(0usize..64, 0..12)) {
            let mut bytes = Vec::new();
            for value in expected_values() {
                bytes.extend(codec::encode(&value).unwrap());
            }

            let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c % (bytes.len() + 1)).collect();
            cuts.sort_unstable();
            cuts.dedup();

            let (mut deframer, received) = recording_deframer();
            let mut start = 0;
            for cut in cuts.into_iter().chain(std::iter::once(bytes.len())) {
                let before = deframer.buffered();
                let emitted = deframer.push(&bytes[start..cut]).unwrap();
                if emitted == 0 {
                    prop_assert_eq!(deframer.buffered(), before + (cut - start));
                }
                start = cut;
            }

            prop_assert_eq!(received.lock().unwrap().clone(), expected_values());
            prop_assert_eq!(deframer.buffered(), 0);
        }
    }
}
