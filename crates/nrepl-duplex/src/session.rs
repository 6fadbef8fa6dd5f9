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

use crate::container::ContainerShared;
use crate::error::{NReplError, Result};
use crate::ids::IdSource;
use crate::lock;
use crate::message::{DescribeResult, Message, status};
use crate::ops::{self, LoadFile};
use crate::registry::{CallbackRegistry, ReactionBundle};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// Runs once a closing session has drained its last outstanding request
pub type CloseHandler = Box<dyn FnOnce(&Session) + Send>;

/// Where a session is in its close sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting operations
    Open,
    /// `close` was sent; the server has not confirmed it yet
    ClosePending,
    /// `session-closed` was observed; waiting for outstanding replies
    Closing,
    /// Close handler has run
    Closed,
}

/// Outcome reported by an `interrupt` operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterruptStatus {
    /// The running evaluation was interrupted
    Interrupted = 1,
    /// Nothing was running in the session
    SessionIdle = 2,
    /// The running evaluation has a different id than the one named
    InterruptIdMismatch = 3,
}

impl InterruptStatus {
    pub const ALL: [InterruptStatus; 3] = [
        InterruptStatus::Interrupted,
        InterruptStatus::SessionIdle,
        InterruptStatus::InterruptIdMismatch,
    ];

    pub fn from_status(status: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_status() == status)
    }

    /// The status marker the server sends for this outcome
    pub fn as_status(self) -> &'static str {
        match self {
            InterruptStatus::Interrupted => status::INTERRUPTED,
            InterruptStatus::SessionIdle => status::SESSION_IDLE,
            InterruptStatus::InterruptIdMismatch => status::INTERRUPT_ID_MISMATCH,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

struct Lifecycle {
    state: SessionState,
    on_closed: Option<CloseHandler>,
}

struct SessionInner {
    id: String,
    ids: Arc<dyn IdSource>,
    container: Weak<ContainerShared>,
    registry: CallbackRegistry,
    lifecycle: Mutex<Lifecycle>,
}

/// A server-side evaluation context
///
/// Sessions are cheap handles: clones share the same callback registry and
/// lifecycle. They are created by [`crate::SessionContainer`], either from a
/// clone reply or by adopting a known id. Every operation returns the
/// message id it was sent under; replies are delivered to the
/// [`ReactionBundle`] passed in.
///
/// Operations are rejected with [`NReplError::SessionClosing`] once the
/// server has reported the session closed.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        id: impl Into<String>,
        ids: Arc<dyn IdSource>,
        container: Weak<ContainerShared>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: id.into(),
                ids,
                container,
                registry: CallbackRegistry::new(),
                lifecycle: Mutex::new(Lifecycle {
                    state: SessionState::Open,
                    on_closed: None,
                }),
            }),
        }
    }

    /// Get the session ID
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> SessionState {
        lock(&self.inner.lifecycle).state
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.state(), SessionState::Closing | SessionState::Closed)
    }

    /// Number of requests still waiting for `done`
    pub fn outstanding(&self) -> usize {
        self.inner.registry.len()
    }

    /// Evaluate `code`
    ///
    /// Wire `value`, `out` and `err` on the bundle to receive results, and
    /// `need-input` to learn when the evaluation blocks on stdin.
    pub fn eval(&self, code: impl Into<String>, bundle: ReactionBundle) -> Result<String> {
        self.issue(bundle, |session, id| ops::eval_request(session, id, code))
    }

    /// Load a whole file's contents, as `eval` does for a form
    pub fn load_file(&self, file: LoadFile, bundle: ReactionBundle) -> Result<String> {
        self.issue(bundle, |session, id| ops::load_file_request(session, id, file))
    }

    /// Send `contents` to an evaluation waiting on stdin
    ///
    /// If the evaluation wants more, `need-input` is reported again.
    pub fn feed_stdin(&self, contents: impl Into<String>, bundle: ReactionBundle) -> Result<String> {
        self.issue(bundle, |session, id| ops::stdin_request(session, id, contents))
    }

    /// Interrupt the running evaluation, or the one with `interrupt_id`
    ///
    /// `result` is called with each interrupt status the server reports.
    pub fn interrupt(
        &self,
        interrupt_id: Option<&str>,
        result: impl FnMut(&Session, InterruptStatus) + Send + 'static,
        bundle: ReactionBundle,
    ) -> Result<String> {
        let result = Arc::new(Mutex::new(result));
        let bundle = InterruptStatus::ALL
            .into_iter()
            .fold(bundle, |bundle, interrupt_status| {
                let result = Arc::clone(&result);
                bundle.on_status(interrupt_status.as_status(), move |session, _| {
                    let mut report = lock(&result);
                    (*report)(session, interrupt_status);
                })
            });

        self.issue(bundle, |session, id| {
            ops::interrupt_request(session, id, interrupt_id)
        })
    }

    /// Ask the server what it supports
    ///
    /// `described` runs once, when the reply is `done`.
    pub fn describe(
        &self,
        described: impl FnOnce(&Session, DescribeResult) + Send + 'static,
    ) -> Result<String> {
        let result = Arc::new(Mutex::new(DescribeResult::default()));
        let (versions, ops) = (Arc::clone(&result), Arc::clone(&result));
        let mut described = Some(described);

        let bundle = ReactionBundle::new()
            .on_field("versions", move |_, _, value| {
                lock(&versions).versions = Some(value.clone());
            })
            .on_field("ops", move |_, _, value| {
                if let Some(dict) = value.as_dict() {
                    lock(&ops).ops = dict.keys().cloned().collect();
                }
            })
            .on_done(move |session, _| {
                if let Some(described) = described.take() {
                    let result = std::mem::take(&mut *lock(&result));
                    described(session, result);
                }
            });

        self.issue(bundle, ops::describe_request)
    }

    /// Clone this session on the server
    ///
    /// The new session is registered in the same container before `created`
    /// sees it.
    pub fn clone_session(&self, created: impl FnOnce(Session) + Send + 'static) -> Result<String> {
        let mut created = Some(created);
        let bundle = ReactionBundle::new().on_field("new-session", move |parent, id, value| {
            let Some(new_id) = value.as_str() else {
                warn!(session = %parent.id(), id = %id, "new-session is not a string");
                return;
            };
            let Some(created) = created.take() else {
                return;
            };
            match parent.container() {
                Ok(container) => created(ContainerShared::adopt(&container, new_id)),
                Err(e) => warn!(session = %parent.id(), error = %e, "dropping cloned session"),
            }
        });

        self.issue(bundle, |session, id| ops::clone_request(id, Some(session)))
    }

    /// Close the session
    pub fn close(&self) -> Result<String> {
        self.close_with(None)
    }

    /// Close the session and run `closed` once it has fully drained
    pub fn close_then(&self, closed: impl FnOnce(&Session) + Send + 'static) -> Result<String> {
        self.close_with(Some(Box::new(closed)))
    }

    fn close_with(&self, on_closed: Option<CloseHandler>) -> Result<String> {
        {
            let mut lifecycle = lock(&self.inner.lifecycle);
            if lifecycle.state != SessionState::Open {
                return Err(NReplError::SessionClosing(self.inner.id.clone()));
            }
            lifecycle.state = SessionState::ClosePending;
            lifecycle.on_closed = on_closed;
        }
        debug!(session = %self.id(), "close requested");

        let sent = self.submit(ReactionBundle::new(), ops::close_request);
        if sent.is_err() {
            let mut lifecycle = lock(&self.inner.lifecycle);
            lifecycle.state = SessionState::Open;
            lifecycle.on_closed = None;
        }
        sent
    }

    /// Route a reply addressed to this session
    ///
    /// A reply without an id is only accepted when it announces
    /// `session-closed`.
    pub(crate) fn results_received(&self, message: &Message) -> Result<()> {
        let closed = message.has_status(status::SESSION_CLOSED);
        if closed {
            self.mark_closing();
        }

        let dispatched = if message.id().is_none() && closed {
            Ok(())
        } else {
            self.inner.registry.dispatch(self, message)
        };

        self.close_if_drained();
        dispatched
    }

    fn mark_closing(&self) {
        let mut lifecycle = lock(&self.inner.lifecycle);
        if lifecycle.state != SessionState::Closed {
            lifecycle.state = SessionState::Closing;
            debug!(session = %self.inner.id, "session closing");
        }
    }

    fn close_if_drained(&self) {
        let on_closed = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            if lifecycle.state != SessionState::Closing || !self.inner.registry.is_empty() {
                return;
            }
            lifecycle.state = SessionState::Closed;
            lifecycle.on_closed.take()
        };

        debug!(session = %self.inner.id, "session closed");
        if let Some(container) = self.inner.container.upgrade() {
            container.forget(&self.inner.id);
        }
        if let Some(on_closed) = on_closed {
            on_closed(self);
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.state() {
            SessionState::Open | SessionState::ClosePending => Ok(()),
            SessionState::Closing | SessionState::Closed => {
                Err(NReplError::SessionClosing(self.inner.id.clone()))
            }
        }
    }

    fn container(&self) -> Result<Arc<ContainerShared>> {
        self.inner.container.upgrade().ok_or_else(|| {
            NReplError::OperationFailed(format!(
                "session {} is no longer attached to a container",
                self.inner.id
            ))
        })
    }

    fn issue(
        &self,
        bundle: ReactionBundle,
        build: impl FnOnce(&str, &str) -> Message,
    ) -> Result<String> {
        self.ensure_usable()?;
        self.submit(bundle, build)
    }

    /// Register `bundle` under a fresh id and send the request
    fn submit(
        &self,
        bundle: ReactionBundle,
        build: impl FnOnce(&str, &str) -> Message,
    ) -> Result<String> {
        let container = self.container()?;
        let id = self.inner.ids.next_id();
        let message = build(&self.inner.id, &id);

        self.inner.registry.register(id.clone(), bundle)?;
        if let Err(e) = container.submit(message) {
            self.inner.registry.unregister(&id);
            return Err(e);
        }

        Ok(id)
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Session {}

impl Hash for Session {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}
