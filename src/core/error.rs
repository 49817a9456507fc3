use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DalError {
    #[error("Uninitialized resource: {0}")]
    Uninitialized(String),

    #[error("Table name is necessary")]
    MissingTableName,

    #[error("Multiple shard strategies defined for table '{table}'")]
    StrategyConflict { table: String },

    #[error("Shard strategy not found for table '{table}'")]
    StrategyNotResolved { table: String },

    #[error("Unsupported composition: {0}")]
    UnsupportedComposition(String),

    #[error("Failed to build pool for data source '{name}': {reason}")]
    PoolBuildFailure { name: String, reason: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Scheduler unavailable: {0}")]
    SchedulerUnavailable(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl DalError {
    /// Wraps any build-time failure as a [`DalError::PoolBuildFailure`] for `name`.
    ///
    /// An error that already is a build failure passes through unchanged.
    pub fn pool_build(name: &str, err: DalError) -> Self {
        match err {
            DalError::PoolBuildFailure { .. } => err,
            other => DalError::PoolBuildFailure {
                name: name.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, DalError>;

impl<T> From<std::sync::PoisonError<T>> for DalError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for DalError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}
