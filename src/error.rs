//! Error Types
//!
//! One error enum per engine seam. Failures cross seams explicitly:
//! load errors abort the run, everything else is recovered to a boolean
//! at the pipeline boundary.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::manifest::expr::ExprError;

/// Errors raised while loading and interpreting a manifest document.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read manifest '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse manifest '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("pipeline '{pipeline}', stage '{stage}': {source}")]
    BadPredicate {
        pipeline: String,
        stage: String,
        #[source]
        source: ExprError,
    },

    #[error("pipeline '{pipeline}', stage '{stage}': bad script expression: {source}")]
    BadScript {
        pipeline: String,
        stage: String,
        #[source]
        source: ExprError,
    },

    #[error("pipeline '{pipeline}': duplicate stage name '{stage}'")]
    DuplicateStage { pipeline: String, stage: String },

    #[error("pipeline '{pipeline}': stage references unknown template '{template}'")]
    UnknownTemplate { pipeline: String, template: String },

    #[error("pipeline '{pipeline}': template '{template}' is not a stage mapping")]
    BadTemplate { pipeline: String, template: String },

    #[error("failed to include manifest '{path}': {source}")]
    Include {
        path: PathBuf,
        #[source]
        source: Box<LoadError>,
    },

    #[error("manifest include cycle detected at '{path}'")]
    IncludeCycle { path: PathBuf },
}

/// Errors raised while locating, resolving, or invoking tools.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("no tool definition found for '{0}'")]
    Unknown(String),

    #[error("cyclic tool dependency: {chain}")]
    CyclicDependency { chain: String },

    #[error("tool '{tool}' has no action '{action}'")]
    UnknownAction { tool: String, action: String },

    #[error("tool '{tool}' failed: {message}")]
    Failed { tool: String, message: String },
}

impl ToolError {
    /// Shorthand for a construction or invocation failure.
    pub fn failed(tool: impl Into<String>, message: impl ToString) -> Self {
        Self::Failed {
            tool: tool.into(),
            message: message.to_string(),
        }
    }
}

/// Errors raised while executing a single stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("predicate evaluation failed: {0}")]
    Predicate(#[source] ExprError),

    #[error("expression evaluation failed: {0}")]
    Expr(#[from] ExprError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("stage references tool '{0}' which the pipeline does not declare")]
    MissingTool(String),

    #[error("file operation on '{path}' failed: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("'{combinator}' items must evaluate to a sequence, got {got}")]
    BadItems {
        combinator: &'static str,
        got: &'static str,
    },
}

/// Errors that cross the run boundary. Only manifest load failures abort
/// a run; every other failure is reduced to a per-pipeline boolean.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Load(#[from] LoadError),
}
