use thiserror::Error;
use vm_gateway::GatewayError;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Already running: {0}")]
    AlreadyRunning(String),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Catalog error: {0}")]
    Catalog(#[from] serde_yaml_ng::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Stable name of the error class, exposed to API clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Database(_) | Self::Migration(_) => "DatabaseError",
            Self::NotFound(_) => "NotFound",
            Self::Validation(_) => "ValidationError",
            Self::InvalidState(_) => "InvalidStateError",
            Self::AlreadyRunning(_) => "AlreadyRunningError",
            Self::Gateway(e) => e.kind(),
            Self::Serialization(_) | Self::Catalog(_) => "SerializationError",
            Self::Io(_) => "IoError",
        }
    }
}
