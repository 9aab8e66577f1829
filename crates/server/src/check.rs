use anyhow::{Context, Result};
use flowpilot_core::workflow::WorkflowDag;
use flowpilot_core::{Step, Workflow};
use serde::Deserialize;
use std::fmt::Write;
use std::path::Path;

/// Workflow definition as posted to `/api/workflows`
#[derive(Debug, Deserialize)]
struct WorkflowFile {
    name: String,
    #[serde(default)]
    description: String,
    steps: Vec<Step>,
}

/// Read and validate a workflow definition from a JSON file
pub fn load(path: &Path) -> Result<Workflow> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let file: WorkflowFile = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    let mut workflow = Workflow::new(file.name, file.steps);
    workflow.description = file.description;
    WorkflowDag::validate(&workflow)
        .with_context(|| format!("Invalid workflow in {}", path.display()))?;
    Ok(workflow)
}

/// Execution plan: one line per step, grouped by the layer it becomes runnable in
pub fn render(workflow: &Workflow) -> Result<String> {
    let dag = WorkflowDag::from_workflow(workflow)?;
    let mut out = String::new();
    writeln!(out, "{} ({} steps)", workflow.name, workflow.steps.len())?;

    for (depth, layer) in dag.topological_layers().into_iter().enumerate() {
        writeln!(out, "layer {}", depth)?;
        for step in layer {
            let mut deps: Vec<String> = dag
                .dependencies(&step.id)?
                .into_iter()
                .map(|id| id.0)
                .collect();
            deps.sort();
            if deps.is_empty() {
                writeln!(out, "  {} [{}]", step.id, step.step_type)?;
            } else {
                writeln!(out, "  {} [{}] <- {}", step.id, step.step_type, deps.join(", "))?;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("workflow.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_render_groups_steps_by_layer() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            r#"{
                "name": "onboarding",
                "steps": [
                    {"id": "welcome", "name": "Welcome", "type": "send_email", "depends_on": ["create"], "step_order": 1},
                    {"id": "create", "name": "Create", "type": "create_patient"},
                    {"id": "remind", "name": "Remind", "type": "send_sms", "depends_on": ["create"], "step_order": 2},
                    {"id": "done", "name": "Done", "type": "noop", "depends_on": ["welcome", "remind"], "step_order": 3}
                ]
            }"#,
        );

        let workflow = load(&path).unwrap();
        let plan = render(&workflow).unwrap();
        assert_eq!(
            plan,
            "onboarding (4 steps)\n\
             layer 0\n  create [create_patient]\n\
             layer 1\n  welcome [send_email] <- create\n  remind [send_sms] <- create\n\
             layer 2\n  done [noop] <- remind, welcome\n"
        );
    }

    #[test]
    fn test_load_rejects_cycle() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            r#"{
                "name": "loop",
                "steps": [
                    {"id": "a", "name": "A", "type": "noop", "depends_on": ["b"]},
                    {"id": "b", "name": "B", "type": "noop", "depends_on": ["a"]}
                ]
            }"#,
        );

        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid workflow"));
    }

    #[test]
    fn test_load_reports_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = load(&dir.path().join("absent.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }
}
