// kiln-common/src/pipeline.rs
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::KilnError;

/// Lifecycle of one package install. `Unpacking` is only entered for
/// releases with an embedded data archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineState {
    Pending,
    Fetching,
    Verifying,
    Unpacking,
    Configuring,
    Building,
    Installing,
    Installed,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Verifying => "verifying",
            Self::Unpacking => "unpacking",
            Self::Configuring => "configuring",
            Self::Building => "building",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A pipeline failure together with the state it failed in.
#[derive(Debug, Clone)]
pub struct PipelineError {
    pub name: String,
    pub state: PipelineState,
    pub source: KilnError,
}

impl PipelineError {
    pub fn new(name: impl Into<String>, state: PipelineState, source: KilnError) -> Self {
        Self {
            name: name.into(),
            state,
            source,
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed for {}: {}", self.state, self.name, self.source)
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StateChanged {
        target_id: String,
        state: PipelineState,
    },
    DependencyPlanned {
        target_id: String,
        dependency: String,
    },
    DownloadStarted {
        target_id: String,
        url: String,
    },
    DownloadCached {
        target_id: String,
        path: PathBuf,
    },
    DownloadFinished {
        target_id: String,
        path: PathBuf,
        size_bytes: u64,
    },
    DownloadFailed {
        target_id: String,
        url: String,
        error: String,
    },
    StepStarted {
        target_id: String,
        command: String,
    },
    JobSuccess {
        target_id: String,
        version: String,
    },
    JobFailed {
        target_id: String,
        state: PipelineState,
        error: String,
    },
    LogWarn {
        target_id: String,
        message: String,
    },
}

impl PipelineEvent {
    pub fn job_failed(err: &PipelineError) -> Self {
        PipelineEvent::JobFailed {
            target_id: err.name.clone(),
            state: err.state,
            error: err.source.to_string(),
        }
    }

    pub fn download_failed(target_id: String, url: String, error: &KilnError) -> Self {
        PipelineEvent::DownloadFailed {
            target_id,
            url,
            error: error.to_string(),
        }
    }

    pub fn target_id(&self) -> &str {
        match self {
            Self::StateChanged { target_id, .. }
            | Self::DependencyPlanned { target_id, .. }
            | Self::DownloadStarted { target_id, .. }
            | Self::DownloadCached { target_id, .. }
            | Self::DownloadFinished { target_id, .. }
            | Self::DownloadFailed { target_id, .. }
            | Self::StepStarted { target_id, .. }
            | Self::JobSuccess { target_id, .. }
            | Self::JobFailed { target_id, .. }
            | Self::LogWarn { target_id, .. } => target_id,
        }
    }
}
