//! DAG traversal structure built from a template's task list.
//!
//! No pointer graph: the structure is a declaration-order id vector plus a
//! pair of adjacency maps (`id -> downstream[]`, `id -> upstream[]`).
//! Validation is a Kahn-style topological iteration over in-degree counters;
//! any node left with a positive in-degree implies a cycle.

use std::collections::HashMap;

use crate::entity::Task;
use crate::{Result, ValidationError};

#[derive(Debug, Clone)]
pub struct TaskGraph {
    /// Task ids in template declaration order. This is the only tie-break the
    /// dispatcher applies when several tasks become runnable at once.
    order: Vec<String>,
    /// Tasks with no dependencies, in declaration order.
    roots: Vec<String>,
    downstream: HashMap<String, Vec<String>>,
    upstream: HashMap<String, Vec<String>>,
}

impl TaskGraph {
    /// Validates that `tasks` forms a DAG and builds the traversal indexes.
    pub fn build(tasks: &[Task]) -> Result<Self> {
        if tasks.is_empty() {
            return Err(ValidationError::Empty.into());
        }

        let mut order = Vec::with_capacity(tasks.len());
        let mut downstream: HashMap<String, Vec<String>> = HashMap::with_capacity(tasks.len());
        let mut upstream: HashMap<String, Vec<String>> = HashMap::with_capacity(tasks.len());

        for task in tasks {
            if upstream.contains_key(&task.id) {
                return Err(ValidationError::DuplicateTaskId(task.id.clone()).into());
            }
            order.push(task.id.clone());
            upstream.insert(task.id.clone(), task.depend_on.clone());
            downstream.entry(task.id.clone()).or_default();
        }

        for task in tasks {
            for dep in &task.depend_on {
                if !upstream.contains_key(dep) {
                    return Err(ValidationError::UnknownDependency {
                        task: task.id.clone(),
                        depend: dep.clone(),
                    }
                    .into());
                }
                downstream
                    .get_mut(dep)
                    .unwrap_or_else(|| unreachable!("all ids were inserted above"))
                    .push(task.id.clone());
            }
        }

        let mut in_degree: HashMap<&str, usize> = order
            .iter()
            .map(|id| (id.as_str(), upstream[id].len()))
            .collect();
        let mut frontier: Vec<&str> = order
            .iter()
            .filter(|id| in_degree[id.as_str()] == 0)
            .map(String::as_str)
            .collect();
        let roots: Vec<String> = frontier.iter().map(|id| id.to_string()).collect();

        let mut visited = 0usize;
        while let Some(id) = frontier.pop() {
            visited += 1;
            for next in &downstream[id] {
                let degree = in_degree
                    .get_mut(next.as_str())
                    .unwrap_or_else(|| unreachable!("downstream ids are validated"));
                *degree -= 1;
                if *degree == 0 {
                    frontier.push(next);
                }
            }
        }

        if visited != order.len() {
            let mut remaining: Vec<String> = in_degree
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            remaining.sort();
            return Err(ValidationError::CycleDetected(remaining).into());
        }

        Ok(Self {
            order,
            roots,
            downstream,
            upstream,
        })
    }

    /// Task ids in declaration order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// The root frontier: tasks with no dependencies.
    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    pub fn downstream(&self, id: &str) -> &[String] {
        self.downstream.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn upstream(&self, id: &str) -> &[String] {
        self.upstream.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.upstream.contains_key(id)
    }

    /// All transitive dependents of `id`, breadth-first, deduplicated.
    pub fn descendants(&self, id: &str) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        let mut queue: Vec<&str> = self.downstream(id).iter().map(String::as_str).collect();
        while let Some(next) = queue.pop() {
            if seen.iter().any(|s| s == next) {
                continue;
            }
            seen.push(next.to_string());
            queue.extend(self.downstream(next).iter().map(String::as_str));
        }
        seen
    }
}
