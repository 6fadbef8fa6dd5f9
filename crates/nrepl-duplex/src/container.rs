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

//! Per-connection session bookkeeping and message routing

use crate::error::{NReplError, Result};
use crate::ids::IdSource;
use crate::lock;
use crate::message::Message;
use crate::ops;
use crate::session::Session;
use crate::transport::{MessageSink, MessageSource};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Receives the session minted by a clone reply
pub type NewSessionCallback = Box<dyn FnOnce(Session) + Send>;

pub(crate) struct ContainerShared {
    sink: Arc<dyn MessageSink>,
    ids: Arc<dyn IdSource>,
    sessions: Mutex<HashMap<String, Session>>,
    pending_new_session: Mutex<HashMap<String, NewSessionCallback>>,
}

impl ContainerShared {
    /// Register a session with `id`, or return the one already known
    pub(crate) fn adopt(this: &Arc<Self>, id: &str) -> Session {
        let mut sessions = lock(&this.sessions);
        sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!(session = %id, "session registered");
                Session::new(id, Arc::clone(&this.ids), Arc::downgrade(this))
            })
            .clone()
    }

    /// Drop a closed session
    pub(crate) fn forget(&self, id: &str) {
        if lock(&self.sessions).remove(id).is_some() {
            debug!(session = %id, "session removed");
        }
    }

    /// Send `message` on behalf of one of our sessions
    pub(crate) fn submit(&self, message: Message) -> Result<()> {
        let session = message.session().ok_or_else(|| {
            NReplError::protocol_with_response("Outbound message without a session", message.to_string())
        })?;

        if !lock(&self.sessions).contains_key(session) {
            return Err(NReplError::SessionNotFound(session.to_string()));
        }

        self.sink.send(message)
    }
}

/// All sessions living on one connection
///
/// Inbound replies are routed here (see [`SessionContainer::listen_to`]) and
/// forwarded to the session they name. Outbound messages from sessions pass
/// through here so a request for a session this connection does not know is
/// rejected before anything is written.
#[derive(Clone)]
pub struct SessionContainer {
    shared: Arc<ContainerShared>,
}

impl SessionContainer {
    pub fn new(sink: Arc<dyn MessageSink>, ids: Arc<dyn IdSource>) -> Self {
        Self {
            shared: Arc::new(ContainerShared {
                sink,
                ids,
                sessions: Mutex::new(HashMap::new()),
                pending_new_session: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Route every message `source` receives into this container
    pub fn listen_to(&self, source: &dyn MessageSource) {
        let container = self.clone();
        source.add_listener(Box::new(move |message| container.accept_inbound(message)));
    }

    /// Ask the server for a fresh session
    ///
    /// `created` runs on the dispatch thread once the clone reply arrives.
    /// Returns the id of the clone request.
    pub fn create_new_session(&self, created: impl FnOnce(Session) + Send + 'static) -> Result<String> {
        let id = self.shared.ids.next_id();
        lock(&self.shared.pending_new_session).insert(id.clone(), Box::new(created));

        if let Err(e) = self.shared.sink.send(ops::clone_request(&id, None)) {
            lock(&self.shared.pending_new_session).remove(&id);
            return Err(e);
        }

        Ok(id)
    }

    /// Route one inbound message
    pub fn accept_inbound(&self, message: &Message) -> Result<()> {
        let pending = message
            .id()
            .and_then(|id| lock(&self.shared.pending_new_session).remove(id));

        if let Some(created) = pending {
            let new_id = message.get_str("new-session").ok_or_else(|| {
                NReplError::protocol_with_response(
                    "Clone reply without new-session",
                    message.to_string(),
                )
            })?;
            created(ContainerShared::adopt(&self.shared, new_id));
            return Ok(());
        }

        let session_id = message.session().ok_or_else(|| {
            NReplError::protocol_with_response("Reply without a session", message.to_string())
        })?;
        let session = self
            .session(session_id)
            .ok_or_else(|| NReplError::SessionNotFound(session_id.to_string()))?;

        session.results_received(message)
    }

    /// Validate and send an outbound message
    ///
    /// The message must name a session held by this container.
    pub fn submit(&self, message: Message) -> Result<()> {
        self.shared.submit(message)
    }

    /// Track a session whose id is already known
    pub fn adopt(&self, id: &str) -> Session {
        ContainerShared::adopt(&self.shared, id)
    }

    pub fn session(&self, id: &str) -> Option<Session> {
        lock(&self.shared.sessions).get(id).cloned()
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.shared.sessions).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Clone requests still waiting for their reply
    pub fn pending_new_sessions(&self) -> usize {
        lock(&self.shared.pending_new_session).len()
    }

    pub fn len(&self) -> usize {
        lock(&self.shared.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for SessionContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContainer")
            .field("sessions", &self.session_ids())
            .field("pending_new_sessions", &self.pending_new_sessions())
            .finish()
    }
}
