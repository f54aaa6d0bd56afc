use std::fmt;

use serde::Serialize;
use thiserror::Error;

use skyforge_common::SynthError;
use skyforge_stacks::ValidationError;

/// One resource the provider reported as failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceFailure {
    pub logical_id: String,
    pub kind: String,
    pub reason: String,
}

impl fmt::Display for ResourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.logical_id, self.kind, self.reason)
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("stack {stack} failed: {reason}")]
    StackFailed {
        stack: String,
        reason: String,
        resources: Vec<ResourceFailure>,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("template for {stack} is {bytes} bytes, over the {limit} byte inline limit; run `skyforge bootstrap` first")]
    NotBootstrapped {
        stack: String,
        bytes: usize,
        limit: usize,
    },

    #[error("unexpected provider output: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProviderError {
    pub fn resources(&self) -> &[ResourceFailure] {
        match self {
            Self::StackFailed { resources, .. } => resources,
            _ => &[],
        }
    }
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Synth(#[from] SynthError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("no stacks selected, pass stack names or --all")]
    EmptySelection,

    #[error("stack {stack} requires {dependency} to be deployed first")]
    MissingDependency { stack: String, dependency: String },

    #[error("stack {stack} is still required by deployed stack {dependent}")]
    StillRequired { stack: String, dependent: String },

    #[error("not bootstrapped: toolkit stack did not report {0}")]
    Bootstrap(String),

    #[error("deploy of {stack} failed")]
    DeployFailed {
        stack: String,
        /// Selected stacks that were not attempted.
        skipped: Vec<String>,
        #[source]
        source: ProviderError,
    },

    #[error("destroy of {stack} failed")]
    DestroyFailed {
        stack: String,
        #[source]
        source: ProviderError,
    },

    #[error(transparent)]
    State(#[from] anyhow::Error),
}

impl DeployError {
    /// Per-resource failure detail, if the provider reported any.
    pub fn resource_failures(&self) -> &[ResourceFailure] {
        match self {
            Self::DeployFailed { source, .. } | Self::DestroyFailed { source, .. } => source.resources(),
            _ => &[],
        }
    }
}
