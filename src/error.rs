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

//! Fatal, programmer-error conditions.
//!
//! Expected outcomes (dead entity, missing component, component already
//! present, conditions all false) are never represented here — they are
//! `bool`/`Option` return values at the call site.

use std::fmt;

/// Fatal error conditions raised at an API boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EcsError {
    /// Two components (or two relations) registered under the same name.
    DuplicateName(String),

    /// A query or command buffer referenced a component that was never
    /// registered.
    UnknownComponent(String),

    /// A relation referenced by name was never registered.
    UnknownRelation(String),

    /// `spawn_with_id` targeted a slot that is currently live.
    SlotAlreadyLive(u32),

    /// `spawn_with_id` targeted a slot whose stored generation did not
    /// match the requested identifier.
    GenerationMismatch { slot: u32, expected: u16, found: u16 },

    /// Scheduler compilation referenced a before/after/set name that no
    /// system or set declares.
    UnknownScheduleTarget(Vec<String>),

    /// Scheduler compilation found a dependency cycle; the names are the
    /// systems on the cycle, in detection order.
    ScheduleCycle(Vec<String>),

    /// `EventQueue::flush` was called while already flushing.
    ReentrantFlush,

    /// `get_target` was called on a relation that is not exclusive, or
    /// that currently has more than one target.
    NotExclusive(String),

    /// The component-mask width (§3, "at least 128 bits") was exceeded by
    /// registration.
    TooManyComponents { limit: usize },
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::DuplicateName(name) => {
                write!(f, "a component or relation named '{name}' is already registered")
            }
            EcsError::UnknownComponent(name) => {
                write!(f, "component '{name}' was never registered")
            }
            EcsError::UnknownRelation(name) => {
                write!(f, "relation '{name}' was never registered")
            }
            EcsError::SlotAlreadyLive(slot) => {
                write!(f, "slot {slot} is already live")
            }
            EcsError::GenerationMismatch { slot, expected, found } => {
                write!(f, "slot {slot} generation mismatch: stored generation is {expected}, requested {found}")
            }
            EcsError::UnknownScheduleTarget(names) => {
                write!(f, "unknown schedule target(s): {}", names.join(", "))
            }
            EcsError::ScheduleCycle(names) => {
                write!(f, "system dependency cycle: {}", names.join(" -> "))
            }
            EcsError::ReentrantFlush => write!(f, "event queue flush called reentrantly"),
            EcsError::NotExclusive(name) => {
                write!(f, "relation '{name}' is not exclusive or has multiple targets")
            }
            EcsError::TooManyComponents { limit } => {
                write!(f, "component registry exceeded the {limit}-bit mask width")
            }
        }
    }
}

impl std::error::Error for EcsError {}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EcsError>;
