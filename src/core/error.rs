//! Error taxonomy for the resolution and execution pipeline.
//!
//! Each stage has its own error type. `Error` wraps them so callers can keep
//! the whole chain and pick their own verbosity via `source()`.

use crate::transport::ExecError;
use std::path::PathBuf;
use thiserror::Error;

/// Any failure of the pipeline.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Generate(#[from] GenerateError),

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// I/O or parse failure on a source file or a chart manifest.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[error("{} must contain a mapping at the top level, found {found}", path.display())]
    NotAMapping { path: PathBuf, found: &'static str },

    #[error("chart of {group}/{unit} must be a mapping or a path string, found {found}")]
    InvalidChart {
        group: String,
        unit: String,
        found: &'static str,
    },

    #[error("cannot render local chart path {path:?}")]
    ChartPath {
        path: String,
        #[source]
        source: Box<TemplateError>,
    },

    #[error("failed to load local chart manifest {}", path.display())]
    ChartManifest {
        path: PathBuf,
        #[source]
        source: Box<LoadError>,
    },

    #[error("config does not match the expected shape")]
    Decode(#[source] serde_json::Error),

    #[error("missing build dependency `{name}` referenced by {group}/{unit}")]
    MissingBuildDependency {
        group: String,
        unit: String,
        name: String,
    },
}

/// A scalar in one layer meets a map in another at the same path.
#[derive(Debug, Error)]
#[error("cannot merge {incoming} over {existing} at `{path}`")]
pub struct MergeError {
    pub path: String,
    pub existing: &'static str,
    pub incoming: &'static str,
}

/// Unknown group or unit name requested.
#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("unknown group `{0}`")]
    UnknownGroup(String),

    #[error("unknown unit `{unit}` in {scope}")]
    UnknownUnit { unit: String, scope: String },
}

/// Template syntax error, unresolved variable, or a function's own failure.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("line {line}: `{expr}` references undefined variable `.{path}`")]
    UndefinedVariable {
        line: usize,
        expr: String,
        path: String,
    },

    #[error("line {line}: unknown function `{name}` in `{expr}`")]
    UnknownFunction {
        line: usize,
        expr: String,
        name: String,
    },

    #[error("line {line}: `{expr}` failed")]
    Function {
        line: usize,
        expr: String,
        #[source]
        source: FunctionError,
    },

    #[error("rendered document is not valid YAML")]
    Document(#[source] serde_yaml_ng::Error),

    #[error("cannot serialize config for rendering")]
    Encode(#[source] serde_yaml_ng::Error),
}

/// Failure inside a template function.
#[derive(Debug, Error)]
pub enum FunctionError {
    #[error("{name} expects {expected} argument(s), got {got}")]
    Arity {
        name: &'static str,
        expected: String,
        got: usize,
    },

    #[error("{name}: {message}")]
    Argument { name: &'static str, message: String },

    #[error("env variable {0:?} was empty")]
    EmptyEnv(String),

    #[error("cannot read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("included file {} exceeds the maximum include depth of {max}", path.display())]
    IncludeDepth { path: PathBuf, max: usize },

    #[error("failed to render {}", path.display())]
    Include {
        path: PathBuf,
        #[source]
        source: Box<TemplateError>,
    },

    #[error("git {action} failed")]
    Git {
        action: String,
        #[source]
        source: ExecError,
    },

    #[error("cannot encode value as {format}: {message}")]
    Encode { format: &'static str, message: String },

    #[error(transparent)]
    Secret(#[from] SecretError),
}

/// Failure reported by a secret provider.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("not signed in to secret provider account `{account}`")]
    AuthenticationRequired { account: String },

    #[error("secret {vault}/{item}{} not found", field.as_deref().map(|f| format!("#{f}")).unwrap_or_default())]
    SecretNotFound {
        vault: String,
        item: String,
        field: Option<String>,
    },

    #[error("secret provider failed: {message}")]
    Provider { message: String },
}

/// Fetch or parse failure of a base schema or a registered fragment.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("cannot fetch schema {source_ref}")]
    Fetch {
        source_ref: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("schema {source_ref} is not a JSON object")]
    Parse {
        source_ref: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("no base schema loaded")]
    NoBase,

    #[error("cannot serialize schema")]
    Encode(#[source] serde_json::Error),
}

/// Failure while writing generated chart artifacts.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("cannot write {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot serialize {what}")]
    Encode {
        what: String,
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[error("{kind} name {name:?} cannot be used as a file name")]
    InvalidName { kind: &'static str, name: String },
}

/// A per-unit operation failure.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{unit}: {operation} exited with code {code}")]
    Failed {
        unit: String,
        operation: String,
        code: i32,
        output: String,
    },

    #[error("{unit}: {operation} could not run")]
    Exec {
        unit: String,
        operation: String,
        #[source]
        source: ExecError,
    },

    #[error("{unit}: {message}")]
    Invalid { unit: String, message: String },

    #[error("{unit}: {operation} produced unreadable output")]
    Output {
        unit: String,
        operation: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("run cancelled with {pending} task(s) not started")]
    Cancelled { pending: usize },
}

impl TaskError {
    /// Identity of the unit that failed, if the error belongs to one.
    pub fn unit(&self) -> Option<&str> {
        match self {
            Self::Failed { unit, .. }
            | Self::Exec { unit, .. }
            | Self::Invalid { unit, .. }
            | Self::Output { unit, .. } => Some(unit),
            Self::Cancelled { .. } => None,
        }
    }

    /// Combined output of the failing command, when there was one.
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Failed { output, .. } => Some(output),
            Self::Exec { source, .. } => source.output(),
            _ => None,
        }
    }
}
