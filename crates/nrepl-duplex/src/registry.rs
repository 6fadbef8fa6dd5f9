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

//! Per-request reaction handlers and their dispatch

use crate::error::{NReplError, Result};
use crate::lock;
use crate::message::{Message, Value, status};
use crate::session::Session;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use std::sync::mpsc::{Receiver, Sender, channel};
use tracing::debug;

/// Handler for a reply field: `(session, message id, field value)`
pub type FieldHandler = Box<dyn FnMut(&Session, &str, &Value) + Send>;

/// Handler for a reply status: `(session, message id)`
pub type StatusHandler = Box<dyn FnMut(&Session, &str) + Send>;

/// The handlers wired to one outstanding request id
///
/// The common fields and statuses have their own slots; anything else goes
/// through [`ReactionBundle::on_field`] / [`ReactionBundle::on_status`].
#[derive(Default)]
pub struct ReactionBundle {
    value: Option<FieldHandler>,
    out: Option<FieldHandler>,
    err: Option<FieldHandler>,
    fields: BTreeMap<String, FieldHandler>,
    need_input: Option<StatusHandler>,
    done: Option<StatusHandler>,
    statuses: BTreeMap<String, StatusHandler>,
}

impl ReactionBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_value(mut self, handler: impl FnMut(&Session, &str, &Value) + Send + 'static) -> Self {
        self.value = Some(Box::new(handler));
        self
    }

    pub fn on_out(mut self, handler: impl FnMut(&Session, &str, &Value) + Send + 'static) -> Self {
        self.out = Some(Box::new(handler));
        self
    }

    pub fn on_err(mut self, handler: impl FnMut(&Session, &str, &Value) + Send + 'static) -> Self {
        self.err = Some(Box::new(handler));
        self
    }

    /// Wire a handler to any reply field
    ///
    /// `id` and `status` are not fields and are ignored.
    pub fn on_field(
        mut self,
        field: impl Into<String>,
        handler: impl FnMut(&Session, &str, &Value) + Send + 'static,
    ) -> Self {
        let field = field.into();
        let handler: FieldHandler = Box::new(handler);
        match field.as_str() {
            "id" | "status" => {}
            "value" => self.value = Some(handler),
            "out" => self.out = Some(handler),
            "err" => self.err = Some(handler),
            _ => {
                self.fields.insert(field, handler);
            }
        }
        self
    }

    /// Called when the evaluator blocks reading stdin
    pub fn on_need_input(mut self, handler: impl FnMut(&Session, &str) + Send + 'static) -> Self {
        self.need_input = Some(Box::new(handler));
        self
    }

    pub fn on_done(mut self, handler: impl FnMut(&Session, &str) + Send + 'static) -> Self {
        self.done = Some(Box::new(handler));
        self
    }

    /// Wire a handler to any status marker
    pub fn on_status(
        mut self,
        marker: impl Into<String>,
        handler: impl FnMut(&Session, &str) + Send + 'static,
    ) -> Self {
        let marker = marker.into();
        let handler: StatusHandler = Box::new(handler);
        match marker.as_str() {
            status::DONE => self.done = Some(handler),
            status::NEED_INPUT => self.need_input = Some(handler),
            _ => {
                self.statuses.insert(marker, handler);
            }
        }
        self
    }

    fn wired_fields(&self) -> Vec<&str> {
        let slots = [
            ("value", self.value.is_some()),
            ("out", self.out.is_some()),
            ("err", self.err.is_some()),
        ];
        slots
            .into_iter()
            .filter_map(|(name, wired)| wired.then_some(name))
            .chain(self.fields.keys().map(String::as_str))
            .collect()
    }

    fn wired_statuses(&self) -> Vec<&str> {
        let slots = [
            (status::NEED_INPUT, self.need_input.is_some()),
            (status::DONE, self.done.is_some()),
        ];
        slots
            .into_iter()
            .filter_map(|(name, wired)| wired.then_some(name))
            .chain(self.statuses.keys().map(String::as_str))
            .collect()
    }

    /// Run every handler matching `message`; returns whether `done` was seen
    ///
    /// Field handlers run first, then status handlers in wire order, with
    /// `done` last since it is terminal.
    fn invoke(&mut self, session: &Session, id: &str, message: &Message) -> bool {
        let slots = [
            ("value", &mut self.value),
            ("out", &mut self.out),
            ("err", &mut self.err),
        ];
        for (field, slot) in slots {
            if let (Some(handler), Some(value)) = (slot.as_mut(), message.get(field)) {
                handler(session, id, value);
            }
        }
        for (field, handler) in self.fields.iter_mut() {
            if let Some(value) = message.get(field) {
                handler(session, id, value);
            }
        }

        let statuses = message.statuses();
        for marker in statuses.iter().copied().filter(|s| *s != status::DONE) {
            let handler = match marker {
                status::NEED_INPUT => self.need_input.as_mut(),
                other => self.statuses.get_mut(other),
            };
            if let Some(handler) = handler {
                handler(session, id);
            }
        }

        let done = statuses.contains(&status::DONE);
        if done {
            if let Some(handler) = self.done.as_mut() {
                handler(session, id);
            }
        }
        done
    }
}

impl fmt::Debug for ReactionBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactionBundle")
            .field("fields", &self.wired_fields())
            .field("statuses", &self.wired_statuses())
            .finish()
    }
}

enum Pending {
    Register(String, ReactionBundle),
    Cancel(String),
}

/// Maps outstanding message ids to their reaction bundles
///
/// Registration happens on caller threads and only touches the
/// outstanding-id set and a handoff channel. The live map is read and
/// written inside [`CallbackRegistry::dispatch`], which runs on the
/// transport's dispatch thread and drains the handoff first.
pub struct CallbackRegistry {
    pending_tx: Sender<Pending>,
    pending_rx: Mutex<Receiver<Pending>>,
    live: Mutex<HashMap<String, ReactionBundle>>,
    outstanding: Mutex<HashSet<String>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        let (pending_tx, pending_rx) = channel();
        Self {
            pending_tx,
            pending_rx: Mutex::new(pending_rx),
            live: Mutex::new(HashMap::new()),
            outstanding: Mutex::new(HashSet::new()),
        }
    }

    /// Queue `bundle` for incorporation under `id`
    ///
    /// Fails if `id` already has a bundle that has not seen `done`.
    pub fn register(&self, id: impl Into<String>, bundle: ReactionBundle) -> Result<()> {
        let id = id.into();
        if !lock(&self.outstanding).insert(id.clone()) {
            return Err(NReplError::DuplicateId(id));
        }

        self.pending_tx
            .send(Pending::Register(id, bundle))
            .map_err(|_| NReplError::OperationFailed("callback registry closed".to_string()))
    }

    /// Withdraw a registration whose request never reached the wire
    pub fn unregister(&self, id: &str) {
        if lock(&self.outstanding).remove(id) {
            let _ = self.pending_tx.send(Pending::Cancel(id.to_string()));
        }
    }

    /// Number of bundles still waiting for `done`
    pub fn len(&self) -> usize {
        lock(&self.outstanding).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_registered(&self, id: &str) -> bool {
        lock(&self.outstanding).contains(id)
    }

    /// Route one reply to the bundle registered for its id
    ///
    /// The bundle is removed once `done` is observed, after its handlers
    /// have run. No lock is held while handlers run, so they are free to
    /// issue further operations.
    pub fn dispatch(&self, session: &Session, message: &Message) -> Result<()> {
        let id = message.id().ok_or_else(|| {
            NReplError::protocol_with_response("Reply without an id", message.to_string())
        })?;

        self.incorporate_pending();

        let bundle = lock(&self.live).remove(id);
        let Some(mut bundle) = bundle else {
            return Err(NReplError::UnregisteredId {
                id: id.to_string(),
                session: session.id().to_string(),
            });
        };

        if bundle.invoke(session, id, message) {
            lock(&self.outstanding).remove(id);
            debug!(session = %session.id(), id = %id, "request done, callbacks removed");
        } else {
            lock(&self.live).insert(id.to_string(), bundle);
        }

        Ok(())
    }

    fn incorporate_pending(&self) {
        let pending = lock(&self.pending_rx);
        let mut live = lock(&self.live);
        while let Ok(item) = pending.try_recv() {
            match item {
                Pending::Register(id, bundle) => {
                    live.insert(id, bundle);
                }
                Pending::Cancel(id) => {
                    live.remove(&id);
                }
            }
        }
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("outstanding", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::CounterIds;
    use std::sync::{Arc, Weak};

    fn detached_session() -> Session {
        Session::new("s1", Arc::new(CounterIds::new()), Weak::new())
    }

    fn reply(id: &str) -> Message {
        Message::new().with("id", id).with("session", "s1")
    }

    fn done(id: &str) -> Message {
        reply(id).with("status", vec![Value::from(status::DONE)])
    }

    #[test]
    fn test_multi_reply_routing() {
        let session = detached_session();
        let registry = CallbackRegistry::new();
        let values = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&values);

        registry
            .register(
                "0",
                ReactionBundle::new().on_value(move |_, _, v| {
                    sink.lock().unwrap().push(v.to_string());
                }),
            )
            .unwrap();

        registry.dispatch(&session, &reply("0").with("value", "6")).unwrap();
        registry.dispatch(&session, &reply("0").with("value", "7")).unwrap();
        assert_eq!(registry.len(), 1);
        registry.dispatch(&session, &done("0")).unwrap();

        assert_eq!(*values.lock().unwrap(), vec!["6", "7"]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_done_removes_exactly_once() {
        let session = detached_session();
        let registry = CallbackRegistry::new();
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);

        registry
            .register(
                "1",
                ReactionBundle::new().on_done(move |_, _| *counter.lock().unwrap() += 1),
            )
            .unwrap();

        registry.dispatch(&session, &done("1")).unwrap();
        let second = registry.dispatch(&session, &done("1"));

        assert!(matches!(second, Err(NReplError::UnregisteredId { ref id, .. }) if id == "1"));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let registry = CallbackRegistry::new();
        registry.register("1", ReactionBundle::new()).unwrap();

        let result = registry.register("1", ReactionBundle::new());
        assert!(matches!(result, Err(NReplError::DuplicateId(ref id)) if id == "1"));
    }

    #[test]
    fn test_id_can_be_reused_after_done() {
        let session = detached_session();
        let registry = CallbackRegistry::new();
        registry.register("1", ReactionBundle::new()).unwrap();
        registry.dispatch(&session, &done("1")).unwrap();

        assert!(registry.register("1", ReactionBundle::new()).is_ok());
    }

    #[test]
    fn test_unregister_withdraws_pending_bundle() {
        let session = detached_session();
        let registry = CallbackRegistry::new();
        registry.register("9", ReactionBundle::new()).unwrap();
        registry.unregister("9");

        assert!(registry.is_empty());
        assert!(matches!(
            registry.dispatch(&session, &done("9")),
            Err(NReplError::UnregisteredId { .. })
        ));
    }

    #[test]
    fn test_status_handlers_run_before_done() {
        let session = detached_session();
        let registry = CallbackRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c) = (Arc::clone(&order), Arc::clone(&order), Arc::clone(&order));

        registry
            .register(
                "2",
                ReactionBundle::new()
                    .on_out(move |_, _, v| a.lock().unwrap().push(format!("out:{}", v)))
                    .on_status("session-idle", move |_, _| b.lock().unwrap().push("idle".to_string()))
                    .on_done(move |_, _| c.lock().unwrap().push("done".to_string())),
            )
            .unwrap();

        let message = reply("2").with("out", "x").with(
            "status",
            vec![Value::from("done"), Value::from("session-idle")],
        );
        registry.dispatch(&session, &message).unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["out:x", "idle", "done"]);
    }

    #[test]
    fn test_unwired_fields_are_ignored() {
        let session = detached_session();
        let registry = CallbackRegistry::new();
        registry.register("3", ReactionBundle::new()).unwrap();

        registry
            .dispatch(&session, &reply("3").with("value", "1").with("ns", "user"))
            .unwrap();
        assert!(registry.is_registered("3"));
    }

    #[test]
    fn test_reply_without_id_is_a_protocol_error() {
        let session = detached_session();
        let registry = CallbackRegistry::new();

        let result = registry.dispatch(&session, &Message::new().with("value", "1"));
        assert!(matches!(result, Err(NReplError::Protocol { .. })));
    }
}
