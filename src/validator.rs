//! Structural checks run on a step forest before any step executes.

use crate::error::EngineError;
use crate::model::{StepKind, StepRecord};
use std::collections::HashSet;

/// Collect every structural problem in `steps`.
///
/// Checks that each step has a known kind, that sequence numbers are
/// unique among siblings, that only condition, loop and group steps have
/// children, and that no step code repeats along a root-to-leaf path.
pub fn validate_steps(steps: &[StepRecord]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut path = Vec::new();
    check_siblings(steps, "root", &mut path, &mut errors);
    errors
}

/// [`validate_steps`] as a pass/fail gate.
pub fn validate_step_tree(steps: &[StepRecord]) -> Result<(), EngineError> {
    let errors = validate_steps(steps);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(EngineError::InvalidStepTree(errors.join("; ")))
    }
}

fn check_siblings(
    steps: &[StepRecord],
    parent: &str,
    path: &mut Vec<String>,
    errors: &mut Vec<String>,
) {
    let mut seen = HashSet::new();
    for step in steps {
        if let Some(no) = step.step_no {
            if !seen.insert(no) {
                errors.push(format!(
                    "duplicate step_no {no} among the children of {parent}"
                ));
            }
        }
        check_step(step, path, errors);
    }
}

fn check_step(step: &StepRecord, path: &mut Vec<String>, errors: &mut Vec<String>) {
    let key = step.key();

    let kind = match step.step_type.as_deref().map(str::trim) {
        None | Some("") => {
            errors.push(format!("step '{key}' has no step_type"));
            None
        }
        Some(raw) => {
            let kind = StepKind::parse(raw);
            if kind.is_none() {
                errors.push(format!("step '{key}' has unsupported step_type '{raw}'"));
            }
            kind
        }
    };

    if !step.children.is_empty() {
        if let Some(kind) = kind.filter(|k| !k.allows_children()) {
            errors.push(format!(
                "step '{key}' of type {} cannot have children",
                kind.as_str()
            ));
        }
    }

    if step.step_code.is_some() && path.contains(&key) {
        errors.push(format!(
            "step '{key}' appears inside itself: {} -> {key}",
            path.join(" -> ")
        ));
        return;
    }

    path.push(key.clone());
    check_siblings(&step.children, &format!("step '{key}'"), path, errors);
    path.pop();
}
