//! Dependency scheduling: validation, linear topological order, and batches
//! of mutually independent steps.
//!
//! Ties are always broken by declaration order, so the same definition
//! produces the same schedule on every run.

use std::collections::HashSet;
use std::sync::Arc;

use folio_types::{FolioError, Result};

use crate::step::{Pipeline, StepUnit};

/// How a run walks the pipeline.
#[derive(Debug, Clone)]
pub enum ExecutionPlan {
    /// One step at a time, in a valid topological order.
    Linear(Vec<Arc<StepUnit>>),
    /// Groups of independent steps; every dependency of a batch member lives
    /// in an earlier batch.
    Batches(Vec<Vec<Arc<StepUnit>>>),
}

impl ExecutionPlan {
    /// The plan as a sequence of batches. A linear plan yields one-step batches.
    pub fn into_batches(self) -> Vec<Vec<Arc<StepUnit>>> {
        match self {
            ExecutionPlan::Linear(units) => units.into_iter().map(|u| vec![u]).collect(),
            ExecutionPlan::Batches(batches) => batches,
        }
    }

    pub fn step_count(&self) -> usize {
        match self {
            ExecutionPlan::Linear(units) => units.len(),
            ExecutionPlan::Batches(batches) => batches.iter().map(Vec::len).sum(),
        }
    }
}

/// Build the plan for `pipeline`, batched when `parallel` is set.
pub fn plan(pipeline: &Pipeline, parallel: bool) -> Result<ExecutionPlan> {
    if parallel {
        Ok(ExecutionPlan::Batches(batches(pipeline.units())?))
    } else {
        Ok(ExecutionPlan::Linear(linear_order(pipeline.units())?))
    }
}

/// Reject duplicate names and dependencies on undeclared steps.
pub fn validate(units: &[Arc<StepUnit>]) -> Result<()> {
    let mut names = HashSet::new();
    for unit in units {
        if !names.insert(unit.name.as_str()) {
            return Err(FolioError::DuplicateStep {
                step: unit.name.clone(),
            });
        }
    }
    for unit in units {
        for dep in &unit.dependencies {
            if !names.contains(dep.as_str()) {
                return Err(FolioError::UnknownDependency {
                    step: unit.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

/// A topological order of `units`. Among steps that are ready at the same
/// time, the one declared first goes first.
pub fn linear_order(units: &[Arc<StepUnit>]) -> Result<Vec<Arc<StepUnit>>> {
    validate(units)?;
    let mut placed: HashSet<&str> = HashSet::new();
    let mut remaining: Vec<&Arc<StepUnit>> = units.iter().collect();
    let mut order = Vec::with_capacity(units.len());

    while !remaining.is_empty() {
        let Some(pos) = remaining
            .iter()
            .position(|u| u.dependencies.iter().all(|d| placed.contains(d.as_str())))
        else {
            return Err(cycle_error(&remaining));
        };
        let unit = remaining.remove(pos);
        placed.insert(unit.name.as_str());
        order.push(Arc::clone(unit));
    }
    Ok(order)
}

/// Group `units` into batches. Each batch holds every step whose dependencies
/// are all satisfied by earlier batches, in declaration order.
pub fn batches(units: &[Arc<StepUnit>]) -> Result<Vec<Vec<Arc<StepUnit>>>> {
    validate(units)?;
    let mut done: HashSet<&str> = HashSet::new();
    let mut remaining: Vec<&Arc<StepUnit>> = units.iter().collect();
    let mut batches = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<_>, Vec<_>) = remaining
            .into_iter()
            .partition(|u| u.dependencies.iter().all(|d| done.contains(d.as_str())));
        if ready.is_empty() {
            return Err(cycle_error(&blocked));
        }
        done.extend(ready.iter().map(|u| u.name.as_str()));
        batches.push(ready.into_iter().map(Arc::clone).collect());
        remaining = blocked;
    }
    Ok(batches)
}

/// Name a step that actually sits on a cycle among the `stuck` units.
///
/// Every stuck unit has at least one stuck dependency, so following the first
/// one repeatedly must revisit a step; that step is on the cycle.
fn cycle_error(stuck: &[&Arc<StepUnit>]) -> FolioError {
    let stuck_names: HashSet<&str> = stuck.iter().map(|u| u.name.as_str()).collect();
    let find = |name: &str| stuck.iter().find(|u| u.name == name);

    let mut seen = HashSet::new();
    let mut current = stuck[0];
    loop {
        if !seen.insert(current.name.as_str()) {
            return FolioError::CycleDetected {
                step: current.name.clone(),
            };
        }
        let next = current
            .dependencies
            .iter()
            .find(|d| stuck_names.contains(d.as_str()))
            .and_then(|d| find(d.as_str()));
        match next {
            Some(unit) => current = *unit,
            None => {
                return FolioError::CycleDetected {
                    step: current.name.clone(),
                }
            }
        }
    }
}
