use std::sync::Arc;

use thiserror::Error;

use crate::model::formula::BuildPhase;
use crate::pipeline::PipelineError;

#[derive(Error, Debug, Clone)]
pub enum KilnError {
    #[error("I/O Error: {0}")]
    Io(#[from] Arc<std::io::Error>),

    #[error("HTTP Request Error: {0}")]
    Http(#[from] Arc<reqwest::Error>),

    #[error("JSON Parsing Error: {0}")]
    Json(#[from] Arc<serde_json::Error>),

    #[error("Semantic Versioning Error: {0}")]
    SemVer(#[from] Arc<semver::Error>),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Invalid formula '{name}': {reason}")]
    InvalidFormula { name: String, reason: String },

    #[error("Parsing Error in {0}: {1}")]
    ParseError(&'static str, String),

    #[error("Version conflict for {name} {version}: already published with sha256 {existing}, refusing {attempted}")]
    VersionConflict {
        name: String,
        version: String,
        existing: String,
        attempted: String,
    },

    #[error("Dependency Error: {0}")]
    DependencyResolution(String),

    #[error("Failed to fetch '{url}': {reason}")]
    Fetch { url: String, reason: String },

    #[error("Checksum Mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("Unpack Error: {0}")]
    Unpack(String),

    #[error("{phase} step exited with {}\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}", describe_exit(.code))]
    Build {
        phase: BuildPhase,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Self-test exited with {}: {output}", describe_exit(.code))]
    Verification { code: Option<i32>, output: String },

    #[error("Failed to execute command: {0}")]
    CommandExec(String),

    #[error("Installation Error: {0}")]
    Install(String),

    #[error("Cancelled before {0}")]
    Cancelled(String),

    #[error(transparent)]
    Pipeline(Arc<PipelineError>),

    #[error("Generic Error: {0}")]
    Generic(String),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "no status (terminated by signal)".to_string(),
    }
}

impl From<std::io::Error> for KilnError {
    fn from(err: std::io::Error) -> Self {
        KilnError::Io(Arc::new(err))
    }
}

impl From<reqwest::Error> for KilnError {
    fn from(err: reqwest::Error) -> Self {
        KilnError::Http(Arc::new(err))
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::Json(Arc::new(err))
    }
}

impl From<semver::Error> for KilnError {
    fn from(err: semver::Error) -> Self {
        KilnError::SemVer(Arc::new(err))
    }
}

impl From<PipelineError> for KilnError {
    fn from(err: PipelineError) -> Self {
        KilnError::Pipeline(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, KilnError>;
