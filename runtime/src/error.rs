use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Invalid runtime configuration: {0}")]
    InvalidConfig(String),

    #[error("Malformed configuration document: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to build tokio runtime: {0}")]
    Build(#[source] std::io::Error),

    #[error("Tracing subscriber already installed")]
    Telemetry,
}
