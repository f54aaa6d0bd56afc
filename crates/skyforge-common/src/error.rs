use thiserror::Error;

/// Errors raised while loading or interpreting `skyforge.json`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid CIDR '{0}'")]
    Cidr(String),

    #[error("no AMI configured for region '{0}'")]
    MissingAmi(String),

    #[error("invalid edge ingress '{0}', expected 'any-ipv4' or a prefix list id (pl-...)")]
    EdgeIngress(String),

    #[error("{0}")]
    Invalid(String),
}

/// Errors raised while building a stack template.
#[derive(Debug, Error)]
pub enum SynthError {
    #[error("duplicate logical id '{logical_id}' in stack {stack}")]
    DuplicateLogicalId { stack: String, logical_id: String },

    #[error("stack {stack} depends on unknown stack {dependency}")]
    UnknownDependency { stack: String, dependency: String },

    #[error("unknown stack '{0}'")]
    UnknownStack(String),

    #[error("stack dependency cycle involving {0}")]
    DependencyCycle(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
