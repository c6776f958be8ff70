//! Workflow Spec Parser
//!
//! Loads workflow specifications from YAML files. Parsing and validation
//! happen together, so a successfully loaded workflow is always runnable.

use std::fs;
use std::path::Path;

use log::{debug, info};
use thiserror::Error;

use super::model::{Workflow, WorkflowSpec};
use super::validator::ValidationError;

/// Error raised while loading a workflow spec from disk.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read workflow file '{path}': {source}. Check that the file exists and is readable.")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse workflow YAML: {0}. Check the file format.")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Loads and validates a workflow from a YAML spec file.
///
/// # Example
///
/// ```rust,no_run
/// use taskdeck::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("pipeline.yaml")?;
///     println!("Loaded {} steps", workflow.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<Workflow, ParseError> {
    let path = path.as_ref();
    info!("Loading workflow spec from: {}", path.display());

    let yaml_content = fs::read_to_string(path).map_err(|e| ParseError::Io {
        path: path.display().to_string(),
        source: e,
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    let spec: WorkflowSpec = serde_yaml::from_str(&yaml_content)?;
    let workflow = Workflow::from_spec(spec)?;

    info!(
        "Workflow '{}' loaded: {} steps, strategy {:?}",
        workflow.name,
        workflow.len(),
        workflow.strategy
    );
    Ok(workflow)
}

/// Parses a workflow spec from a YAML string without touching disk.
pub fn parse_workflow(yaml: &str) -> Result<Workflow, ParseError> {
    let spec: WorkflowSpec = serde_yaml::from_str(yaml)?;
    Ok(Workflow::from_spec(spec)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::ExecutionStrategy;
    use std::io::Write;

    const VALID_SPEC: &str = r#"
name: nightly-report
strategy: parallel
max_parallel_steps: 2
steps:
  - name: Fetch Records
    capability: crm.query
    estimated_duration_ms: 2000
  - name: Summarize
    capability: llm.summarize
    dependencies:
      - fetch-records
    publish_as: summary
"#;

    #[test]
    fn test_parse_valid_spec() {
        let workflow = parse_workflow(VALID_SPEC).unwrap();
        assert_eq!(workflow.name, "nightly-report");
        assert_eq!(workflow.strategy, ExecutionStrategy::Parallel);
        assert_eq!(workflow.max_parallel_steps, 2);
        assert_eq!(workflow.len(), 2);
        assert_eq!(workflow.steps[0].id, "fetch-records");
        assert_eq!(workflow.steps[1].dependencies[0].step_id, "fetch-records");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(VALID_SPEC.as_bytes()).unwrap();

        let workflow = load_workflow(&path).unwrap();
        assert_eq!(workflow.len(), 2);
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_workflow("/nonexistent/pipeline.yaml").unwrap_err();
        assert!(matches!(err, ParseError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/pipeline.yaml"));
    }

    #[test]
    fn test_parse_malformed_yaml() {
        let err = parse_workflow("steps: [unclosed").unwrap_err();
        assert!(matches!(err, ParseError::Yaml(_)));
    }

    #[test]
    fn test_parse_invalid_reference() {
        let yaml = r#"
name: broken
steps:
  - name: Only
    capability: cap
    dependencies: [ghost]
"#;
        let err = parse_workflow(yaml).unwrap_err();
        assert!(matches!(err, ParseError::Validation(_)));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_parse_cyclic_spec() {
        let yaml = r#"
name: cyclic
steps:
  - name: A
    capability: cap
    dependencies: [b]
  - id: b
    name: B
    capability: cap
    dependencies: [a]
"#;
        let err = parse_workflow(yaml).unwrap_err();
        assert!(err.to_string().contains("cyclic"));
    }
}
