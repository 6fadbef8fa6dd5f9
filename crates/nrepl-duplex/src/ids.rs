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

//! Message id sources
//!
//! Ids only need to be unique per connection. Sessions and the container
//! share one source so clone replies and ordinary replies never collide.

use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Produces unique message ids; safe to call from any thread
pub trait IdSource: Send + Sync {
    fn next_id(&self) -> String;
}

/// Monotonically increasing decimal ids
#[derive(Debug)]
pub struct CounterIds {
    next: AtomicU64,
}

impl CounterIds {
    /// Counter starting at 1
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl Default for CounterIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSource for CounterIds {
    fn next_id(&self) -> String {
        self.next.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

/// Random v4 UUIDs, as used by the async client
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIds;

impl IdSource for UuidIds {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}
