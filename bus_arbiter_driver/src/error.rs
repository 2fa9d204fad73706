use std::path::PathBuf;

use bus_arbiter_core::ArbiterError;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Arbiter(#[from] ArbiterError),

    #[error("failed to read workload file {path}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed workload config")]
    ParseConfig(#[from] serde_json::Error),

    #[error("failed to spawn task {name}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("task {name} panicked")]
    TaskPanicked { name: String },
}
