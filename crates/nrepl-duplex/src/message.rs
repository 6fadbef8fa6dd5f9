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

use crate::error::{NReplError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Status markers carried in the `status` list of nREPL replies
pub mod status {
    pub const DONE: &str = "done";
    pub const ERROR: &str = "error";
    pub const SESSION_CLOSED: &str = "session-closed";
    pub const NEED_INPUT: &str = "need-input";
    pub const INTERRUPTED: &str = "interrupted";
    pub const SESSION_IDLE: &str = "session-idle";
    pub const INTERRUPT_ID_MISMATCH: &str = "interrupt-id-mismatch";
}

/// Bencode value types that can appear in nREPL messages
///
/// nREPL is a text protocol, so byte strings are held as UTF-8 `String`s.
/// Dictionaries keep their keys ordered, which is also the order bencode
/// requires on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Str(String),
    Int(i64),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Dict(dict) => Some(dict),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Int(i) => write!(f, "{}", i),
            Value::List(list) => {
                let items: Vec<String> = list.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Value::Dict(dict) => {
                let items: Vec<String> = dict.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
                write!(f, "{{{}}}", items.join(", "))
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<Vec<Value>> for Value {
    fn from(list: Vec<Value>) -> Self {
        Value::List(list)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(dict: BTreeMap<String, Value>) -> Self {
        Value::Dict(dict)
    }
}

/// A single nREPL message: an ordered string-keyed map
///
/// Requests carry `op` and `id`. Replies carry `id`, usually `session`, and
/// an optional `status` list; everything else is operation specific.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(BTreeMap<String, Value>);

impl Message {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Start a request for `op` tagged with message id `id`
    pub fn request(op: &str, id: impl Into<String>) -> Self {
        Self::new().with("op", op).with("id", id.into())
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert only when `value` is present
    pub fn with_opt<V: Into<Value>>(self, key: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(v) => self.with(key, v),
            None => self,
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn op(&self) -> Option<&str> {
        self.get_str("op")
    }

    pub fn id(&self) -> Option<&str> {
        self.get_str("id")
    }

    pub fn session(&self) -> Option<&str> {
        self.get_str("session")
    }

    /// Status markers in wire order
    ///
    /// Some servers send a bare string instead of a list; both are accepted.
    pub fn statuses(&self) -> Vec<&str> {
        match self.get("status") {
            Some(Value::List(list)) => list.iter().filter_map(Value::as_str).collect(),
            Some(Value::Str(s)) => vec![s.as_str()],
            _ => Vec::new(),
        }
    }

    pub fn has_status(&self, status: &str) -> bool {
        self.statuses().contains(&status)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items: Vec<String> = self.0.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
        write!(f, "{{{}}}", items.join(", "))
    }
}

impl TryFrom<Value> for Message {
    type Error = NReplError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Dict(dict) => Ok(Message(dict)),
            other => Err(NReplError::protocol_with_response(
                "nREPL messages must be dictionaries",
                other.to_string(),
            )),
        }
    }
}

impl From<Message> for Value {
    fn from(message: Message) -> Self {
        Value::Dict(message.0)
    }
}

/// Accumulated result of an eval or load-file operation
#[derive(Debug, Clone, Default)]
pub struct EvalResult {
    pub value: Option<String>,
    pub output: Vec<String>,
    pub error: Vec<String>,
    pub ns: Option<String>,
}

impl EvalResult {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Result of a describe operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescribeResult {
    /// Raw `versions` map as sent by the server
    pub versions: Option<Value>,
    /// Names of the operations the server supports
    pub ops: Vec<String>,
}
