//! Dependency graph of creatable resources
//!
//! Resources that must exist before a parent can be written (a storage account
//! for OS disk containers, a public IP for a gateway frontend) are registered
//! here as [`Creatable`] units. [`DependencyGraph::resolve_all`] creates them in
//! topological order, running every task of a wave concurrently, and keeps
//! each result addressable by the key handed out at registration.
//!
//! # Example
//!
//! ```ignore
//! let mut graph = DependencyGraph::new();
//! let key = graph.register_dependency(storage_account);
//! graph.resolve_all().await?;
//! let account = graph.result(&key).unwrap();
//! ```

mod definition;

pub use definition::ResourceDefinition;

use crate::error::{FluentError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Key identifying a registered task, stable for one create/update cycle
pub type TaskKey = String;

/// A deferred description of a resource that can be created on demand.
#[async_trait]
pub trait Creatable: Send + Sync {
    /// Prefix used when the graph assigns this unit a key
    fn key_prefix(&self) -> &str {
        "task"
    }

    /// Units that must be created before this one
    fn dependencies(&self) -> Vec<Arc<dyn Creatable>> {
        Vec::new()
    }

    /// Create the resource. `dependencies` holds the results of every prerequisite.
    async fn create(&self, dependencies: &DependencyResults) -> anyhow::Result<Value>;
}

/// Results of completed prerequisites, addressable by key or by unit.
#[derive(Debug, Clone, Default)]
pub struct DependencyResults {
    by_key: HashMap<TaskKey, Value>,
    by_unit: HashMap<usize, TaskKey>,
}

impl DependencyResults {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.by_key.get(key)
    }

    /// Result of a specific unit, for creatables that hold their own dependencies
    pub fn for_unit(&self, unit: &Arc<dyn Creatable>) -> Option<&Value> {
        self.by_unit
            .get(&unit_id(unit))
            .and_then(|key| self.by_key.get(key))
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

/// Execution state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

struct CreatableTask {
    key: TaskKey,
    prerequisites: Vec<TaskKey>,
    state: TaskState,
    result: Option<Value>,
    unit: Arc<dyn Creatable>,
}

/// Identity of a unit; registering the same `Arc` twice yields one task.
fn unit_id(unit: &Arc<dyn Creatable>) -> usize {
    Arc::as_ptr(unit) as *const () as usize
}

/// Acyclic task graph over creatable units
#[derive(Default)]
pub struct DependencyGraph {
    /// Registration order; prerequisites always precede their dependents
    tasks: Vec<CreatableTask>,
    index: HashMap<TaskKey, usize>,
    units: HashMap<usize, TaskKey>,
    next_seq: usize,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit and, recursively, the units it depends on.
    pub fn register_dependency(&mut self, unit: Arc<dyn Creatable>) -> TaskKey {
        let id = unit_id(&unit);
        if let Some(key) = self.units.get(&id) {
            return key.clone();
        }

        self.next_seq += 1;
        let key = format!("{}-{}", unit.key_prefix(), self.next_seq);
        // Claim the identity before recursing so a unit reachable from its own
        // dependencies resolves to this key and surfaces as a cycle later.
        self.units.insert(id, key.clone());

        let mut prerequisites = Vec::new();
        for dependency in unit.dependencies() {
            let dep_key = self.register_dependency(dependency);
            if !prerequisites.contains(&dep_key) {
                prerequisites.push(dep_key);
            }
        }

        tracing::debug!("registered dependency {} (after {:?})", key, prerequisites);
        self.index.insert(key.clone(), self.tasks.len());
        self.tasks.push(CreatableTask {
            key: key.clone(),
            prerequisites,
            state: TaskState::Pending,
            result: None,
            unit,
        });
        key
    }

    /// Declare that `dependent` must not start before `prerequisite` completes.
    pub fn add_prerequisite(&mut self, dependent: &str, prerequisite: &str) -> Result<()> {
        if !self.index.contains_key(prerequisite) {
            return Err(FluentError::UnknownDependency(prerequisite.to_string()));
        }
        let Some(&idx) = self.index.get(dependent) else {
            return Err(FluentError::UnknownDependency(dependent.to_string()));
        };

        let task = &mut self.tasks[idx];
        if !task.prerequisites.iter().any(|p| p == prerequisite) {
            task.prerequisites.push(prerequisite.to_string());
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn keys(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.key.as_str()).collect()
    }

    pub fn state(&self, key: &str) -> Option<TaskState> {
        self.index.get(key).map(|&idx| self.tasks[idx].state)
    }

    /// Result of a completed task
    pub fn result(&self, key: &str) -> Option<&Value> {
        self.index
            .get(key)
            .and_then(|&idx| self.tasks[idx].result.as_ref())
    }

    /// Whether any registered task has not completed yet
    pub fn has_pending(&self) -> bool {
        self.tasks.iter().any(|t| t.state != TaskState::Completed)
    }

    /// Drop every task and result
    pub fn clear(&mut self) {
        self.tasks.clear();
        self.index.clear();
        self.units.clear();
    }

    /// Create every task that has not completed yet, leaves first.
    ///
    /// Fails with [`FluentError::CyclicDependency`] before running anything if
    /// the graph has a cycle, and with [`FluentError::DependencyExecution`] for
    /// the first failing task, in which case no later wave is started.
    /// Completed tasks are never executed again.
    pub async fn resolve_all(&mut self) -> Result<BTreeMap<TaskKey, Value>> {
        self.check_acyclic()?;

        loop {
            let ready = self.ready_tasks();
            if ready.is_empty() {
                break;
            }

            let mut wave = Vec::with_capacity(ready.len());
            for &idx in &ready {
                let inputs = self.prerequisite_results(idx);
                let task = &mut self.tasks[idx];
                task.state = TaskState::Running;
                tracing::info!("creating dependency {}", task.key);
                let unit = Arc::clone(&task.unit);
                wave.push(async move { unit.create(&inputs).await });
            }

            let outcomes = futures::future::join_all(wave).await;

            let mut first_failure = None;
            for (idx, outcome) in ready.into_iter().zip(outcomes) {
                let task = &mut self.tasks[idx];
                match outcome {
                    Ok(value) => {
                        task.state = TaskState::Completed;
                        task.result = Some(value);
                    }
                    Err(err) => {
                        tracing::warn!("dependency {} failed: {:#}", task.key, err);
                        task.state = TaskState::Failed;
                        if first_failure.is_none() {
                            first_failure = Some(FluentError::DependencyExecution {
                                key: task.key.clone(),
                                source: err,
                            });
                        }
                    }
                }
            }

            if let Some(err) = first_failure {
                return Err(err);
            }
        }

        Ok(self
            .tasks
            .iter()
            .filter_map(|t| t.result.clone().map(|r| (t.key.clone(), r)))
            .collect())
    }

    /// Tasks not yet completed whose prerequisites all are, in registration order
    fn ready_tasks(&self) -> Vec<usize> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| matches!(t.state, TaskState::Pending | TaskState::Failed))
            .filter(|(_, t)| {
                t.prerequisites
                    .iter()
                    .all(|p| self.state(p) == Some(TaskState::Completed))
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    fn prerequisite_results(&self, idx: usize) -> DependencyResults {
        let mut results = DependencyResults::default();
        for key in &self.tasks[idx].prerequisites {
            let Some(&p) = self.index.get(key) else {
                continue;
            };
            let prereq = &self.tasks[p];
            if let Some(value) = &prereq.result {
                results.by_key.insert(key.clone(), value.clone());
                results.by_unit.insert(unit_id(&prereq.unit), key.clone());
            }
        }
        results
    }

    /// Kahn's algorithm over all tasks; leftovers mean a cycle.
    fn check_acyclic(&self) -> Result<()> {
        let mut in_degree: Vec<usize> = self
            .tasks
            .iter()
            .map(|t| t.prerequisites.len())
            .collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.tasks.len()];
        for (idx, task) in self.tasks.iter().enumerate() {
            for prereq in &task.prerequisites {
                if let Some(&p) = self.index.get(prereq) {
                    dependents[p].push(idx);
                }
            }
        }

        let mut queue: Vec<usize> = (0..self.tasks.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut visited = 0;
        while let Some(idx) = queue.pop() {
            visited += 1;
            for &d in &dependents[idx] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    queue.push(d);
                }
            }
        }

        if visited == self.tasks.len() {
            return Ok(());
        }

        let stuck: Vec<usize> = (0..self.tasks.len()).filter(|&i| in_degree[i] > 0).collect();
        Err(FluentError::CyclicDependency {
            keys: self.find_cycle(&stuck),
        })
    }

    /// Walk prerequisite edges from a stuck task until a key repeats.
    fn find_cycle(&self, stuck: &[usize]) -> Vec<String> {
        let Some(&start) = stuck.first() else {
            return Vec::new();
        };

        let mut path: Vec<usize> = vec![start];
        let mut current = start;
        loop {
            let next = self.tasks[current]
                .prerequisites
                .iter()
                .filter_map(|p| self.index.get(p).copied())
                .find(|p| stuck.contains(p));
            let Some(next) = next else {
                break;
            };
            if let Some(pos) = path.iter().position(|&i| i == next) {
                let mut cycle: Vec<String> = path[pos..]
                    .iter()
                    .map(|&i| self.tasks[i].key.clone())
                    .collect();
                cycle.push(self.tasks[next].key.clone());
                return cycle;
            }
            path.push(next);
            current = next;
        }

        stuck.iter().map(|&i| self.tasks[i].key.clone()).collect()
    }
}
