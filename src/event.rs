// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! String-keyed typed event queue.
//!
//! Events are identified by a type name rather than a Rust type, so the
//! same queue serves every event kind the embedding game defines.
//! Payloads are JSON values, matching the crate's `serde_json` snapshot
//! boundary.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::error::{EcsError, Result};

struct Handler {
    id: u64,
    priority: i32,
    callback: Box<dyn FnMut(&Value)>,
}

#[derive(Clone)]
struct LogEntry {
    event_type: String,
    tick: u64,
    value: Value,
}

/// A FIFO-per-type, priority-ordered-across-handlers event channel.
pub struct EventQueue {
    queues: FxHashMap<String, VecDeque<Value>>,
    pending_next: FxHashMap<String, VecDeque<Value>>,
    handlers: FxHashMap<String, Vec<Handler>>,
    any_handlers: Vec<Handler>,
    next_handler_id: u64,
    flushing: bool,
    recording: bool,
    log: Vec<LogEntry>,
    current_tick: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            queues: FxHashMap::default(),
            pending_next: FxHashMap::default(),
            handlers: FxHashMap::default(),
            any_handlers: Vec::new(),
            next_handler_id: 0,
            flushing: false,
            recording: false,
            log: Vec::new(),
            current_tick: 0,
        }
    }

    pub fn set_recording(&mut self, recording: bool) {
        self.recording = recording;
    }

    pub fn set_current_tick(&mut self, tick: u64) {
        self.current_tick = tick;
    }

    /// Enqueue `value` on `event_type`'s channel. Emitting while flushing
    /// enqueues for the *next* flush rather than the one in progress.
    pub fn emit(&mut self, event_type: &str, value: Value) {
        if self.recording {
            self.log.push(LogEntry { event_type: event_type.to_string(), tick: self.current_tick, value: value.clone() });
        }
        let target = if self.flushing { &mut self.pending_next } else { &mut self.queues };
        target.entry(event_type.to_string()).or_default().push_back(value);
    }

    /// Subscribe to `event_type`. Handlers are kept sorted by priority
    /// ascending; ties preserve subscription order (stable sort).
    pub fn on(&mut self, event_type: &str, priority: i32, callback: impl FnMut(&Value) + 'static) -> u64 {
        let id = self.next_handler_id;
        self.next_handler_id += 1;
        let bucket = self.handlers.entry(event_type.to_string()).or_default();
        bucket.push(Handler { id, priority, callback: Box::new(callback) });
        bucket.sort_by_key(|h| h.priority);
        id
    }

    /// Subscribe to every event type.
    pub fn on_any(&mut self, priority: i32, callback: impl FnMut(&Value) + 'static) -> u64 {
        let id = self.next_handler_id;
        self.next_handler_id += 1;
        self.any_handlers.push(Handler { id, priority, callback: Box::new(callback) });
        self.any_handlers.sort_by_key(|h| h.priority);
        id
    }

    pub fn unsubscribe(&mut self, id: u64) {
        for bucket in self.handlers.values_mut() {
            bucket.retain(|h| h.id != id);
        }
        self.any_handlers.retain(|h| h.id != id);
    }

    /// Process every queued event: types in alphabetical order, events
    /// FIFO within a type, handlers (type-specific and `on_any`, merged)
    /// in priority-ascending order. Forbidden while already flushing.
    pub fn flush(&mut self) -> Result<()> {
        if self.flushing {
            return Err(EcsError::ReentrantFlush);
        }
        self.flushing = true;
        let mut types: Vec<String> = self.queues.keys().cloned().collect();
        types.sort();

        for event_type in types {
            let Some(mut queue) = self.queues.remove(&event_type) else { continue };
            while let Some(value) = queue.pop_front() {
                self.dispatch(&event_type, &value);
            }
        }

        self.flushing = false;
        for (event_type, mut pending) in self.pending_next.drain() {
            let queue = self.queues.entry(event_type).or_default();
            queue.append(&mut pending);
        }
        Ok(())
    }

    fn dispatch(&mut self, event_type: &str, value: &Value) {
        // Merge type-specific and wildcard handlers by priority, stable
        // on ties with type-specific handlers running first within a tie
        // (both lists are already priority-sorted on insert).
        let mut type_handlers = self.handlers.remove(event_type).unwrap_or_default();
        let mut merged: Vec<&mut Handler> = Vec::with_capacity(type_handlers.len() + self.any_handlers.len());
        merged.extend(type_handlers.iter_mut());
        merged.extend(self.any_handlers.iter_mut());
        merged.sort_by_key(|h| h.priority);
        for handler in merged {
            (handler.callback)(value);
        }
        self.handlers.insert(event_type.to_string(), type_handlers);
    }

    /// Call `flush` repeatedly (up to `max_depth` times) so events
    /// emitted by one flush's handlers are processed in the same logical
    /// tick. Returns `true` if events still remained after `max_depth`
    /// rounds.
    pub fn flush_recursive(&mut self, max_depth: u32) -> Result<bool> {
        for _ in 0..max_depth {
            self.flush()?;
            if self.queues.values().all(VecDeque::is_empty) {
                return Ok(false);
            }
        }
        let remaining = !self.queues.values().all(VecDeque::is_empty);
        if remaining {
            #[cfg(feature = "profiling")]
            tracing::warn!(max_depth, "recursive event flush exceeded depth with events still queued");
        }
        Ok(remaining)
    }

    pub fn drain(&mut self, event_type: &str) -> Vec<Value> {
        self.queues.remove(event_type).map(|q| q.into_iter().collect()).unwrap_or_default()
    }

    pub fn peek(&self, event_type: &str) -> Vec<Value> {
        self.queues.get(event_type).map(|q| q.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.queues.clear();
        self.pending_next.clear();
    }

    pub fn pending_count(&self, event_type: &str) -> usize {
        self.queues.get(event_type).map(VecDeque::len).unwrap_or(0)
    }

    pub fn log_entries(&self) -> impl Iterator<Item = (&str, u64, &Value)> {
        self.log.iter().map(|e| (e.event_type.as_str(), e.tick, &e.value))
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn flush_is_alphabetical_by_type_fifo_within_type() {
        let mut queue = EventQueue::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        {
            let order = order.clone();
            queue.on("beta", 0, move |v| order.borrow_mut().push(v.as_str().unwrap().to_string()));
        }
        {
            let order = order.clone();
            queue.on("alpha", 0, move |v| order.borrow_mut().push(v.as_str().unwrap().to_string()));
        }
        queue.emit("beta", Value::String("b1".into()));
        queue.emit("alpha", Value::String("a1".into()));
        queue.emit("alpha", Value::String("a2".into()));
        queue.flush().unwrap();
        assert_eq!(*order.borrow(), vec!["a1", "a2", "b1"]);
    }

    #[test]
    fn handlers_run_in_priority_ascending_order() {
        let mut queue = EventQueue::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        {
            let order = order.clone();
            queue.on("hit", 10, move |_| order.borrow_mut().push("late"));
        }
        {
            let order = order.clone();
            queue.on("hit", -5, move |_| order.borrow_mut().push("early"));
        }
        queue.emit("hit", Value::Null);
        queue.flush().unwrap();
        assert_eq!(*order.borrow(), vec!["early", "late"]);
    }

    #[test]
    fn reentrant_flush_is_rejected() {
        let mut queue = EventQueue::new();
        queue.on("x", 0, |_| {});
        queue.emit("x", Value::Null);
        // Simulate re-entry by manually setting the flushing flag, since
        // a handler cannot hold `&mut self` to call flush() itself.
        queue.flushing = true;
        let err = queue.flush().unwrap_err();
        assert_eq!(err, EcsError::ReentrantFlush);
    }

    #[test]
    fn events_emitted_during_flush_wait_for_next_flush() {
        let mut queue = EventQueue::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        queue.emit("a", Value::Null);
        queue.flush().unwrap();
        // After the first flush, emit again and ensure it's picked up by
        // a second flush call.
        {
            let seen = seen.clone();
            queue.on("a", 0, move |_| seen.borrow_mut().push(()));
        }
        queue.emit("a", Value::Null);
        queue.flush().unwrap();
        assert_eq!(seen.borrow().len(), 1);
    }
}
