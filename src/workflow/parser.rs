//! Workflow file parsing.
//!
//! # Responsibilities
//! - Read the workflow YAML document from disk
//! - Merge per-resource fragments from the sibling `resources/` directory
//! - Reject definitions the gateway cannot serve
//!
//! # Design Decisions
//! - Parsing is synchronous; async callers run it on the blocking pool
//! - Inline resources win over fragments with the same `actionId`
//! - Fragments load in file-name order so reloads are deterministic

use std::fs;
use std::path::{Path, PathBuf};

use crate::workflow::model::{Resource, Workflow};

/// Error type for workflow parsing.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid workflow: {0}")]
    Invalid(String),
}

/// Turns a workflow file into a validated [`Workflow`].
pub trait WorkflowParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<Workflow, ParseError>;
}

/// Default parser backed by `serde_yaml`.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlWorkflowParser;

impl YamlWorkflowParser {
    pub fn new() -> Self {
        Self
    }

    fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ParseError> {
        let content = fs::read_to_string(path).map_err(|source| ParseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ParseError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Fragments from `<workflow dir>/resources`, sorted by file name.
    fn load_resource_fragments(workflow_path: &Path) -> Result<Vec<Resource>, ParseError> {
        let dir = match workflow_path.parent() {
            Some(parent) => parent.join("resources"),
            None => return Ok(Vec::new()),
        };
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&dir).map_err(|source| ParseError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_yaml_file(path))
            .collect();
        files.sort();

        files.iter().map(|path| Self::read_yaml(path)).collect()
    }
}

impl WorkflowParser for YamlWorkflowParser {
    fn parse(&self, path: &Path) -> Result<Workflow, ParseError> {
        let mut workflow: Workflow = Self::read_yaml(path)?;

        for resource in Self::load_resource_fragments(path)? {
            let id = &resource.metadata.action_id;
            let inline = workflow
                .resources
                .iter()
                .any(|existing| &existing.metadata.action_id == id);
            if !inline {
                workflow.resources.push(resource);
            }
        }

        validate(&workflow)?;
        Ok(workflow)
    }
}

/// Returns true for `*.yaml` / `*.yml` paths.
pub fn is_yaml_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn validate(workflow: &Workflow) -> Result<(), ParseError> {
    if workflow.metadata.name.trim().is_empty() {
        return Err(ParseError::Invalid("metadata.name is required".into()));
    }
    if workflow.metadata.target_action_id.trim().is_empty() {
        return Err(ParseError::Invalid(
            "metadata.targetActionId is required".into(),
        ));
    }
    for route in workflow.settings.routes() {
        if !route.path.starts_with('/') {
            return Err(ParseError::Invalid(format!(
                "route path must start with '/': {}",
                route.path
            )));
        }
    }
    Ok(())
}
