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

/// nREPL operation builders
use crate::message::Message;

/// Contents and optional metadata for a load-file operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadFile {
    pub contents: String,
    pub file_name: Option<String>,
    pub file_path: Option<String>,
}

impl LoadFile {
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            file_name: None,
            file_path: None,
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn with_file_path(mut self, file_path: impl Into<String>) -> Self {
        self.file_path = Some(file_path.into());
        self
    }
}

/// `session` is omitted for the connection-level clone that creates the
/// first session
pub fn clone_request(id: &str, session: Option<&str>) -> Message {
    Message::request("clone", id).with_opt("session", session)
}

pub fn eval_request(session: &str, id: &str, code: impl Into<String>) -> Message {
    Message::request("eval", id)
        .with("session", session)
        .with("code", code.into())
}

pub fn load_file_request(session: &str, id: &str, file: LoadFile) -> Message {
    Message::request("load-file", id)
        .with("session", session)
        .with("file", file.contents)
        .with_opt("file-name", file.file_name)
        .with_opt("file-path", file.file_path)
}

pub fn close_request(session: &str, id: &str) -> Message {
    Message::request("close", id).with("session", session)
}

pub fn describe_request(session: &str, id: &str) -> Message {
    Message::request("describe", id).with("session", session)
}

pub fn interrupt_request(session: &str, id: &str, interrupt_id: Option<&str>) -> Message {
    Message::request("interrupt", id)
        .with("session", session)
        .with_opt("interrupt-id", interrupt_id)
}

pub fn stdin_request(session: &str, id: &str, stdin: impl Into<String>) -> Message {
    Message::request("stdin", id)
        .with("session", session)
        .with("stdin", stdin.into())
}
