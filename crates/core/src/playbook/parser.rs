//! Playbook parsing and structural validation.
//!
//! Loads playbooks from YAML and enforces the graph invariants the broker
//! relies on: unique step names, resolvable transition targets, reserved
//! `start`/`end` steps, and well-formed tool/loop specs.

use std::collections::HashSet;

use crate::error::{CoreError, CoreResult};
use crate::playbook::types::{Playbook, ToolKind, END_STEP, START_STEP};

/// Parse a playbook from YAML and validate it.
pub fn parse(yaml: &str) -> CoreResult<Playbook> {
    let playbook: Playbook = serde_yaml::from_str(yaml)?;
    validate(&playbook)?;
    Ok(playbook)
}

/// Validate the structural invariants of a playbook graph.
pub fn validate(playbook: &Playbook) -> CoreResult<()> {
    if playbook.workflow.is_empty() {
        return Err(CoreError::Validation("Workflow has no steps".to_string()));
    }

    // Unique step names
    let mut names = HashSet::new();
    for step in &playbook.workflow {
        if step.step.is_empty() {
            return Err(CoreError::Validation("Step with empty name".to_string()));
        }
        if !names.insert(step.step.as_str()) {
            return Err(CoreError::Validation(format!(
                "Duplicate step name: {}",
                step.step
            )));
        }
    }

    playbook
        .get_step(START_STEP)
        .ok_or_else(|| CoreError::Validation(format!("Missing reserved step '{}'", START_STEP)))?;

    // Every transition target must exist; start must have no predecessors;
    // end must have no successors.
    for step in &playbook.workflow {
        for target in step.transition_targets() {
            if !names.contains(target) {
                return Err(CoreError::Validation(format!(
                    "Step '{}' transitions to unknown step '{}'",
                    step.step, target
                )));
            }
            if target == START_STEP {
                return Err(CoreError::Validation(format!(
                    "Step '{}' transitions into the reserved '{}' step",
                    step.step, START_STEP
                )));
            }
        }
        if step.step == END_STEP && !step.next.is_empty() {
            return Err(CoreError::Validation(format!(
                "Reserved step '{}' must not have successors",
                END_STEP
            )));
        }
    }

    // Per-step spec checks
    for step in &playbook.workflow {
        if let Some(tool) = &step.tool {
            if tool.kind == ToolKind::ChildPlaybook && tool.path.is_none() {
                return Err(CoreError::Validation(format!(
                    "Step '{}' is child_playbook but has no tool.path",
                    step.step
                )));
            }
        }
        if let Some(spec) = &step.r#loop {
            if spec.element.is_empty() {
                return Err(CoreError::Validation(format!(
                    "Step '{}' loop has an empty element name",
                    step.step
                )));
            }
            if step.tool_kind() == ToolKind::ChildPlaybook {
                return Err(CoreError::Validation(format!(
                    "Step '{}' cannot combine loop with child_playbook",
                    step.step
                )));
            }
        }
        if let Some(retry) = &step.retry {
            if let Some(on_error) = &retry.on_error {
                if on_error.max_attempts < 1 {
                    return Err(CoreError::Validation(format!(
                        "Step '{}' retry.on_error.max_attempts must be >= 1",
                        step.step
                    )));
                }
            }
            if let Some(on_success) = &retry.on_success {
                if on_success.max_attempts < 1 {
                    return Err(CoreError::Validation(format!(
                        "Step '{}' retry.on_success.max_attempts must be >= 1",
                        step.step
                    )));
                }
            }
        }
    }

    Ok(())
}
