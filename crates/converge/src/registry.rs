//! Step registry - the declarative set of steps and their dependency edges

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::RegistryError;
use crate::types::Step;

/// Registered steps, kept in registration order
#[derive(Debug, Default, Clone)]
pub struct Registry {
    steps: Vec<Arc<Step>>,
    index: HashMap<String, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from steps declared in any order
    ///
    /// Ids are collected first, dependencies resolved second, so a step may
    /// name a dependency declared further down. Registration order is the
    /// declaration order.
    pub fn from_steps<I>(steps: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = Step>,
    {
        let mut registry = Self::new();
        for mut step in steps {
            if registry.contains(&step.id) {
                return Err(RegistryError::DuplicateId(step.id));
            }
            step.dedup_dependencies();
            registry.insert(step);
        }

        for step in &registry.steps {
            if let Some(dep) = step.depends_on.iter().find(|d| !registry.contains(d)) {
                return Err(RegistryError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        Ok(registry)
    }

    /// Register a step whose dependencies are already registered
    pub fn register(&mut self, mut step: Step) -> Result<(), RegistryError> {
        if self.contains(&step.id) {
            return Err(RegistryError::DuplicateId(step.id));
        }
        if let Some(dep) = step.depends_on.iter().find(|d| !self.contains(d)) {
            return Err(RegistryError::UnknownDependency {
                step: step.id.clone(),
                dependency: dep.clone(),
            });
        }
        step.dedup_dependencies();
        self.insert(step);
        Ok(())
    }

    fn insert(&mut self, step: Step) {
        self.index.insert(step.id.clone(), self.steps.len());
        self.steps.push(Arc::new(step));
    }

    /// All steps in registration order
    pub fn all(&self) -> &[Arc<Step>] {
        &self.steps
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Step>> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    /// Registration index of a step
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
