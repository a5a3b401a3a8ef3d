use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid run id {0:?}: use 1-64 ASCII letters, digits, '-' or '_'")]
    InvalidRunId(String),
}

/// Errors raised while resolving the pipeline configuration. All of them are
/// fatal: a run never starts with an invalid configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("no API key: set api.key or the {0} environment variable")]
    MissingApiKey(&'static str),

    #[error("invalid configuration: {0}")]
    Validation(String),
}
