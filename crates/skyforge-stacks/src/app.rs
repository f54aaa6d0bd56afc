use std::collections::BTreeSet;

use skyforge_common::{AppConfig, StackTemplate, SynthError};

use crate::load_balancer::synth_load_balancer;
use crate::network::synth_network;
use crate::service::synth_service;
use crate::validate::{validate_stacks, ValidationError};

/// The synthesized application: every stack, in dependency order.
#[derive(Debug, Clone)]
pub struct App {
    stacks: Vec<StackTemplate>,
}

impl App {
    /// Validates the config and builds the network, load-balancer and
    /// service stacks.
    pub fn synth(cfg: &AppConfig) -> Result<Self, SynthError> {
        cfg.validate()?;
        let app = Self::from_stacks(vec![
            synth_network(cfg)?,
            synth_load_balancer(cfg)?,
            synth_service(cfg)?,
        ])?;
        tracing::debug!(
            stacks = ?app.names().collect::<Vec<_>>(),
            "synthesized app"
        );
        Ok(app)
    }

    /// Orders `stacks` so each one follows its dependencies. Ties keep the
    /// given order.
    pub fn from_stacks(stacks: Vec<StackTemplate>) -> Result<Self, SynthError> {
        let names: BTreeSet<&str> = stacks.iter().map(|s| s.name.as_str()).collect();
        for s in &stacks {
            if let Some(dep) = s.depends_on.iter().find(|d| !names.contains(d.as_str())) {
                return Err(SynthError::UnknownDependency {
                    stack: s.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        let mut pending = stacks;
        let mut ordered: Vec<StackTemplate> = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            let ready = pending.iter().position(|s| {
                s.depends_on
                    .iter()
                    .all(|d| ordered.iter().any(|o| &o.name == d))
            });
            match ready {
                Some(i) => ordered.push(pending.remove(i)),
                None => return Err(SynthError::DependencyCycle(pending[0].name.clone())),
            }
        }
        Ok(Self { stacks: ordered })
    }

    /// Stacks in deploy order.
    pub fn stacks(&self) -> &[StackTemplate] {
        &self.stacks
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stacks.iter().map(|s| s.name.as_str())
    }

    pub fn stack(&self, name: &str) -> Option<&StackTemplate> {
        self.stacks.iter().find(|s| s.name == name)
    }

    pub fn destroy_order(&self) -> impl Iterator<Item = &StackTemplate> {
        self.stacks.iter().rev()
    }

    /// Stacks that depend on `name`, directly or through another stack.
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        let mut found: Vec<&str> = Vec::new();
        // Dependents always come later in deploy order.
        for s in &self.stacks {
            if s.depends_on.iter().any(|d| d == name || found.contains(&d.as_str())) {
                found.push(&s.name);
            }
        }
        found
    }

    /// Resolves a command-line selection, in deploy order.
    pub fn select(&self, names: &[String], all: bool) -> Result<Vec<&StackTemplate>, SynthError> {
        if all {
            return Ok(self.stacks.iter().collect());
        }
        if let Some(unknown) = names.iter().find(|n| self.stack(n).is_none()) {
            return Err(SynthError::UnknownStack(unknown.clone()));
        }
        Ok(self
            .stacks
            .iter()
            .filter(|s| names.contains(&s.name))
            .collect())
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_stacks(&self.stacks)
    }
}
