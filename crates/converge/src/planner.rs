//! Execution planner - linearizes the step graph
//!
//! Kahn's algorithm over registration indices. Among steps whose
//! dependencies are all placed, the earliest registered goes first, so the
//! same registry always yields the same plan.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::error::PlanError;
use crate::registry::Registry;
use crate::types::Step;

/// A dependency-respecting order over steps
///
/// Immutable once produced; recompute it when the registry changes.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    steps: Vec<Arc<Step>>,
}

impl Plan {
    pub fn steps(&self) -> &[Arc<Step>] {
        &self.steps
    }

    pub fn ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Compute the plan for every registered step
pub fn plan(registry: &Registry) -> Result<Plan, PlanError> {
    let order = linearize(registry)?;
    Ok(Plan {
        steps: order
            .into_iter()
            .map(|i| Arc::clone(&registry.all()[i]))
            .collect(),
    })
}

/// Compute the plan for `targets` and their transitive dependencies
///
/// Relative order matches the full plan. An empty target list means every step.
pub fn plan_for<S: AsRef<str>>(registry: &Registry, targets: &[S]) -> Result<Plan, PlanError> {
    if targets.is_empty() {
        return plan(registry);
    }

    let mut wanted: HashSet<usize> = HashSet::new();
    let mut stack = Vec::new();
    for target in targets {
        let target = target.as_ref();
        let index = registry
            .position(target)
            .ok_or_else(|| PlanError::UnknownStep(target.to_string()))?;
        stack.push(index);
    }

    while let Some(index) = stack.pop() {
        if !wanted.insert(index) {
            continue;
        }
        for dep in &registry.all()[index].depends_on {
            if let Some(dep_index) = registry.position(dep) {
                stack.push(dep_index);
            }
        }
    }

    let order = linearize(registry)?;
    Ok(Plan {
        steps: order
            .into_iter()
            .filter(|i| wanted.contains(i))
            .map(|i| Arc::clone(&registry.all()[i]))
            .collect(),
    })
}

fn linearize(registry: &Registry) -> Result<Vec<usize>, PlanError> {
    let steps = registry.all();
    let mut in_degree = vec![0usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];

    for (index, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            // Registry guarantees dependencies resolve
            if let Some(dep_index) = registry.position(dep) {
                in_degree[index] += 1;
                dependents[dep_index].push(index);
            }
        }
    }

    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| i)
        .collect();
    let mut order = Vec::with_capacity(steps.len());

    while let Some(index) = ready.pop_first() {
        order.push(index);
        for &dependent in &dependents[index] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() < steps.len() {
        let cycle = find_cycle(registry, &in_degree);
        log::debug!("Cycle among steps: {:?}", cycle);
        return Err(PlanError::CycleDetected(cycle));
    }

    Ok(order)
}

/// Walk unplaced steps through unplaced dependencies until one repeats
///
/// Every step left with a positive in-degree has at least one dependency
/// that is also left, so the walk always closes a loop.
fn find_cycle(registry: &Registry, in_degree: &[usize]) -> Vec<String> {
    let steps = registry.all();
    let unplaced = |i: usize| in_degree[i] > 0;

    let Some(start) = (0..steps.len()).find(|&i| unplaced(i)) else {
        return Vec::new();
    };

    let mut path: Vec<usize> = vec![start];
    let mut current = start;
    loop {
        let next = steps[current]
            .depends_on
            .iter()
            .filter_map(|dep| registry.position(dep))
            .find(|&i| unplaced(i));

        let Some(next) = next else {
            return vec![steps[current].id.clone()];
        };

        if let Some(pos) = path.iter().position(|&i| i == next) {
            return path[pos..]
                .iter()
                .map(|&i| steps[i].id.clone())
                .collect();
        }

        path.push(next);
        current = next;
    }
}
