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

//! Phase-partitioned system graph with set inheritance and run
//! conditions, compiled via Kahn's algorithm.

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::component::ComponentId;
use crate::error::{EcsError, Result};
use crate::world::World;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    PreUpdate,
    Update,
    PostUpdate,
}

const PHASES: [Phase; 3] = [Phase::PreUpdate, Phase::Update, Phase::PostUpdate];

pub type SystemCallback = Box<dyn FnMut(&mut World)>;
/// A composable run condition. `Rc` rather than a plain closure so that a
/// system set's conditions can be cloned into every member system.
pub type Condition = Rc<dyn Fn(&World) -> bool>;

pub fn and(a: Condition, b: Condition) -> Condition {
    Rc::new(move |w| a(w) && b(w))
}

pub fn or(a: Condition, b: Condition) -> Condition {
    Rc::new(move |w| a(w) || b(w))
}

pub fn not(a: Condition) -> Condition {
    Rc::new(move |w| !a(w))
}

pub fn resource_exists(name: impl Into<String>) -> Condition {
    let name = name.into();
    Rc::new(move |w| w.has_resource(&name))
}

pub fn state_equals(key: impl Into<String>, value: impl Into<String>) -> Condition {
    let key = key.into();
    let value = value.into();
    Rc::new(move |w| w.state_get(&key).map(|v| v == value).unwrap_or(false))
}

pub fn entity_exists_with_component(component: ComponentId) -> Condition {
    Rc::new(move |w| w.any_entity_has_component(component))
}

pub fn event_present(event_type: impl Into<String>) -> Condition {
    let event_type = event_type.into();
    Rc::new(move |w| w.event_pending_count(&event_type) > 0)
}

pub fn tick_modulus(n: u64) -> Condition {
    Rc::new(move |w| n != 0 && w.tick() % n == 0)
}

/// Becomes permanently false after the first call that returns true.
pub fn run_once() -> Condition {
    let fired = Rc::new(Cell::new(false));
    Rc::new(move |_w| {
        if fired.get() {
            false
        } else {
            fired.set(true);
            true
        }
    })
}

/// Builder for one system's registration.
pub struct SystemConfig {
    name: String,
    phase: Phase,
    before: Vec<String>,
    after: Vec<String>,
    sets: Vec<String>,
    conditions: Vec<Condition>,
    once: bool,
    callback: SystemCallback,
}

impl SystemConfig {
    pub fn new(name: impl Into<String>, phase: Phase, callback: impl FnMut(&mut World) + 'static) -> Self {
        Self {
            name: name.into(),
            phase,
            before: Vec::new(),
            after: Vec::new(),
            sets: Vec::new(),
            conditions: Vec::new(),
            once: false,
            callback: Box::new(callback),
        }
    }

    pub fn before(mut self, name: impl Into<String>) -> Self {
        self.before.push(name.into());
        self
    }

    pub fn after(mut self, name: impl Into<String>) -> Self {
        self.after.push(name.into());
        self
    }

    pub fn in_set(mut self, set: impl Into<String>) -> Self {
        self.sets.push(set.into());
        self
    }

    pub fn run_if(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }
}

struct SystemEntry {
    name: String,
    phase: Phase,
    before: Vec<String>,
    after: Vec<String>,
    sets: Vec<String>,
    own_conditions: Vec<Condition>,
    enabled: bool,
    once: bool,
    callback: SystemCallback,
}

struct SystemSetEntry {
    conditions: Vec<Condition>,
    before_sets: Vec<String>,
}

/// A configured (but not necessarily compiled) system set.
pub struct SystemSetConfig {
    name: String,
    conditions: Vec<Condition>,
    before_sets: Vec<String>,
}

impl SystemSetConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), conditions: Vec::new(), before_sets: Vec::new() }
    }

    pub fn run_if(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn before_set(mut self, set: impl Into<String>) -> Self {
        self.before_sets.push(set.into());
        self
    }
}

struct PhasePlan {
    order: Vec<usize>,
}

/// Phase-partitioned system graph. Compiles lazily on first run and
/// whenever a new system or set is registered.
pub struct Schedule {
    systems: Vec<SystemEntry>,
    sets: FxHashMap<String, SystemSetEntry>,
    name_to_index: FxHashMap<String, usize>,
    plans: FxHashMap<Phase, PhasePlan>,
    compiled: bool,
}

impl Schedule {
    pub fn new() -> Self {
        Self {
            systems: Vec::new(),
            sets: FxHashMap::default(),
            name_to_index: FxHashMap::default(),
            plans: FxHashMap::default(),
            compiled: false,
        }
    }

    pub fn add_system(&mut self, config: SystemConfig) {
        let index = self.systems.len();
        self.name_to_index.insert(config.name.clone(), index);
        self.systems.push(SystemEntry {
            name: config.name,
            phase: config.phase,
            before: config.before,
            after: config.after,
            sets: config.sets,
            own_conditions: config.conditions,
            enabled: true,
            once: config.once,
            callback: config.callback,
        });
        self.compiled = false;
    }

    pub fn configure_set(&mut self, config: SystemSetConfig) {
        self.sets.insert(config.name, SystemSetEntry { conditions: config.conditions, before_sets: config.before_sets });
        self.compiled = false;
    }

    pub fn system_count(&self) -> usize {
        self.systems.len()
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) {
        if let Some(&idx) = self.name_to_index.get(name) {
            self.systems[idx].enabled = enabled;
        }
    }

    fn members_of_set(&self, set_name: &str) -> Vec<usize> {
        self.systems.iter().enumerate().filter(|(_, s)| s.sets.iter().any(|s| s == set_name)).map(|(i, _)| i).collect()
    }

    /// Compile the dependency graph: validate names, fold set ordering
    /// and inherited conditions into each system, topologically sort
    /// each phase.
    fn compile(&mut self) -> Result<()> {
        let mut unknown = Vec::new();
        for system in &self.systems {
            for name in system.before.iter().chain(system.after.iter()) {
                if !self.name_to_index.contains_key(name) {
                    unknown.push(name.clone());
                }
            }
            for set in &system.sets {
                if !self.sets.contains_key(set) {
                    unknown.push(set.clone());
                }
            }
        }
        for set in self.sets.values() {
            for before_set in &set.before_sets {
                if !self.sets.contains_key(before_set) {
                    unknown.push(before_set.clone());
                }
            }
        }
        if !unknown.is_empty() {
            unknown.sort();
            unknown.dedup();
            return Err(EcsError::UnknownScheduleTarget(unknown));
        }

        // before[i] = indices that must run strictly after i (i -> j edge
        // means i before j).
        let n = self.systems.len();
        let mut before_edges: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (i, system) in self.systems.iter().enumerate() {
            for name in &system.before {
                before_edges[i].push(self.name_to_index[name]);
            }
            for name in &system.after {
                before_edges[self.name_to_index[name]].push(i);
            }
        }

        for (set_name, set) in &self.sets {
            let members_a = self.members_of_set(set_name);
            for before_set in &set.before_sets {
                let members_b = self.members_of_set(before_set);
                for &a in &members_a {
                    for &b in &members_b {
                        before_edges[a].push(b);
                    }
                }
            }
        }

        for entry in &mut self.systems {
            let mut final_conditions: Vec<Condition> = Vec::new();
            for set_name in &entry.sets {
                if let Some(set) = self.sets.get(set_name) {
                    final_conditions.extend(set.conditions.iter().cloned());
                }
            }
            final_conditions.extend(entry.own_conditions.iter().cloned());
            entry.own_conditions = final_conditions;
        }

        let names: Vec<String> = self.systems.iter().map(|s| s.name.clone()).collect();
        let mut plans = FxHashMap::default();
        for &phase in &PHASES {
            let members: Vec<usize> = self.systems.iter().enumerate().filter(|(_, s)| s.phase == phase).map(|(i, _)| i).collect();
            let order = topo_sort(&members, &before_edges, &names)?;
            plans.insert(phase, PhasePlan { order });
        }
        self.plans = plans;
        self.compiled = true;
        Ok(())
    }

    /// Run every phase in order: `PreUpdate`, `Update`, `PostUpdate`.
    /// Compiles on first call or after any registration since the last
    /// compile.
    pub fn run(&mut self, world: &mut World) -> Result<()> {
        if !self.compiled {
            self.compile()?;
        }
        for &phase in &PHASES {
            let order = self.plans[&phase].order.clone();
            for idx in order {
                let system = &mut self.systems[idx];
                if !system.enabled {
                    continue;
                }
                let all_pass = system.own_conditions.iter().all(|cond| cond(world));
                if all_pass {
                    (system.callback)(world);
                    if system.once {
                        system.enabled = false;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn system_names(&self, phase: Phase) -> Vec<&str> {
        self.systems.iter().filter(|s| s.phase == phase).map(|s| s.name.as_str()).collect()
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self::new()
    }
}

/// Kahn's algorithm restricted to `members`; `before_edges[i]` lists
/// global indices that must run after `i`. On a cycle, returns the names
/// of every system still unprocessed, in detection order.
fn topo_sort(members: &[usize], before_edges: &[Vec<usize>], names: &[String]) -> Result<Vec<usize>> {
    use std::collections::HashSet;
    let member_set: HashSet<usize> = members.iter().copied().collect();

    let mut in_degree: FxHashMap<usize, usize> = members.iter().map(|&m| (m, 0)).collect();
    for &m in members {
        for &dest in &before_edges[m] {
            if member_set.contains(&dest) {
                *in_degree.get_mut(&dest).unwrap() += 1;
            }
        }
    }

    let mut queue: VecDeque<usize> = members.iter().copied().filter(|m| in_degree[m] == 0).collect();
    let mut queue_vec: Vec<usize> = queue.iter().copied().collect();
    queue_vec.sort_unstable();
    queue = queue_vec.into();

    let mut order = Vec::with_capacity(members.len());
    while let Some(node) = queue.pop_front() {
        order.push(node);
        let mut newly_free = Vec::new();
        for &dest in &before_edges[node] {
            if let Some(degree) = in_degree.get_mut(&dest) {
                *degree -= 1;
                if *degree == 0 {
                    newly_free.push(dest);
                }
            }
        }
        newly_free.sort_unstable();
        for f in newly_free {
            queue.push_back(f);
        }
    }

    if order.len() != members.len() {
        let mut remaining: Vec<String> =
            members.iter().filter(|m| !order.contains(m)).map(|&m| names[m].clone()).collect();
        remaining.sort();
        return Err(EcsError::ScheduleCycle(remaining));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentRegistry;
    use std::cell::RefCell;

    fn log_system(name: &str, log: &Rc<RefCell<Vec<String>>>) -> SystemConfig {
        let log = log.clone();
        let owned = name.to_string();
        SystemConfig::new(name, Phase::Update, move |_w| log.borrow_mut().push(owned.clone()))
    }

    #[test]
    fn before_after_ordering_is_honored() {
        let mut world = World::new(ComponentRegistry::new());
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut schedule = Schedule::new();
        schedule.add_system(log_system("b", &log).after("a"));
        schedule.add_system(log_system("a", &log).before("b"));
        schedule.add_system(log_system("c", &log).after("b"));
        schedule.run(&mut world).unwrap();
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn three_system_cycle_is_detected() {
        let mut world = World::new(ComponentRegistry::new());
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut schedule = Schedule::new();
        schedule.add_system(log_system("a", &log).after("c"));
        schedule.add_system(log_system("b", &log).after("a"));
        schedule.add_system(log_system("c", &log).after("b"));
        let err = schedule.run(&mut world).unwrap_err();
        match err {
            EcsError::ScheduleCycle(names) => {
                assert_eq!(names, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
            }
            other => panic!("expected ScheduleCycle, got {other:?}"),
        }
    }

    #[test]
    fn once_system_disables_itself_after_first_run() {
        let mut world = World::new(ComponentRegistry::new());
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut schedule = Schedule::new();
        schedule.add_system(log_system("once", &log).once());
        schedule.run(&mut world).unwrap();
        schedule.run(&mut world).unwrap();
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn unknown_before_target_is_reported() {
        let mut world = World::new(ComponentRegistry::new());
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut schedule = Schedule::new();
        schedule.add_system(log_system("a", &log).before("ghost"));
        let err = schedule.run(&mut world).unwrap_err();
        assert_eq!(err, EcsError::UnknownScheduleTarget(vec!["ghost".to_string()]));
    }
}
