//! Preparation chains
//!
//! A chain is stored as rows carrying a `next_id`. Reads rebuild an
//! id-to-step map and walk the links from the head, so no pointer graph
//! outlives a single call.

use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{ServiceError, ServiceResult};
use crate::models::{ChainOwner, PreparationStep};

/// Validate a batch of steps and resolve its `next` references.
///
/// Every id is indexed before any link is looked at, so a step may point at
/// one that appears later in the batch. A `next_id` outside the batch is
/// dropped with a warning. Duplicate ids, two steps sharing a successor and
/// cycles are rejected.
pub fn link_steps(steps: &[PreparationStep]) -> ServiceResult<Vec<PreparationStep>> {
    let mut known = HashSet::with_capacity(steps.len());
    for step in steps {
        if !known.insert(step.id) {
            return Err(ServiceError::InvalidChain(format!(
                "step {} appears more than once",
                step.id
            )));
        }
    }

    let mut linked = Vec::with_capacity(steps.len());
    let mut incoming: HashMap<Uuid, Uuid> = HashMap::new();
    for step in steps {
        let mut step = step.clone();
        if let Some(next_id) = step.next_id {
            if !known.contains(&next_id) {
                tracing::warn!(
                    step_id = %step.id,
                    next_id = %next_id,
                    "Dropping link to a step outside the batch"
                );
                step.next_id = None;
            } else if next_id == step.id {
                return Err(ServiceError::InvalidChain(format!(
                    "step {} points at itself",
                    step.id
                )));
            } else if let Some(previous) = incoming.insert(next_id, step.id) {
                return Err(ServiceError::InvalidChain(format!(
                    "step {next_id} follows both {previous} and {}",
                    step.id
                )));
            }
        }
        linked.push(step);
    }

    // With at most one predecessor per step, a cycle is a loop no head reaches.
    if unreachable_count(&linked) > 0 {
        return Err(ServiceError::InvalidChain("steps form a cycle".to_string()));
    }

    Ok(linked)
}

/// Steps that no head reaches by following `next`
fn unreachable_count(steps: &[PreparationStep]) -> usize {
    let by_id: HashMap<Uuid, &PreparationStep> = steps.iter().map(|s| (s.id, s)).collect();
    let targets: HashSet<Uuid> = steps.iter().filter_map(|s| s.next_id).collect();

    let mut seen = HashSet::new();
    for head in steps.iter().filter(|s| !targets.contains(&s.id)) {
        let mut current = Some(head);
        while let Some(step) = current {
            if !seen.insert(step.id) {
                break;
            }
            current = step.next_id.and_then(|id| by_id.get(&id).copied());
        }
    }
    steps.len() - seen.len()
}

/// Put stored steps into chain order.
///
/// Heads are the steps nothing points at, taken in stored order; each head's
/// run is followed to its end. Steps no head reaches are appended in stored
/// order so nothing is lost.
pub fn order_chain(steps: Vec<PreparationStep>) -> Vec<PreparationStep> {
    let targets: HashSet<Uuid> = steps.iter().filter_map(|s| s.next_id).collect();
    let heads: Vec<Uuid> = steps
        .iter()
        .filter(|s| !targets.contains(&s.id))
        .map(|s| s.id)
        .collect();
    let stored_order: Vec<Uuid> = steps.iter().map(|s| s.id).collect();
    let mut arena: HashMap<Uuid, PreparationStep> =
        steps.into_iter().map(|s| (s.id, s)).collect();

    let mut ordered = Vec::with_capacity(arena.len());
    for head in heads {
        let mut current = Some(head);
        while let Some(id) = current {
            let Some(step) = arena.remove(&id) else {
                break;
            };
            current = step.next_id;
            ordered.push(step);
        }
    }

    for id in stored_order {
        if let Some(step) = arena.remove(&id) {
            ordered.push(step);
        }
    }

    ordered
}

/// Sum of step durations in minutes
pub fn sum_durations(steps: &[PreparationStep]) -> u32 {
    steps.iter().map(|s| s.duration_minutes).sum()
}

/// Store a new chain for `owner`
pub fn build(db: &Database, owner: ChainOwner, steps: &[PreparationStep]) -> ServiceResult<()> {
    let linked = link_steps(steps)?;
    db.insert_chain(owner, &linked)?;
    tracing::debug!(?owner, steps = linked.len(), "Preparation chain built");
    Ok(())
}

/// Swap the whole chain of `owner` for `steps` in one transaction
pub fn replace(db: &Database, owner: ChainOwner, steps: &[PreparationStep]) -> ServiceResult<()> {
    let linked = link_steps(steps)?;
    db.replace_chain(owner, &linked)?;
    tracing::debug!(?owner, steps = linked.len(), "Preparation chain replaced");
    Ok(())
}

/// Steps of `owner` in chain order, read fresh from storage
pub fn traverse(db: &Database, owner: ChainOwner) -> ServiceResult<Vec<PreparationStep>> {
    Ok(order_chain(db.load_chain(owner)?))
}

/// Total preparation minutes of `owner`; 0 when it has no chain
pub fn total_duration(db: &Database, owner: ChainOwner) -> ServiceResult<u32> {
    Ok(sum_durations(&traverse(db, owner)?))
}
