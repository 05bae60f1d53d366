use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    StdIoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] anyhow::Error),

    #[error("Command execution error: {0}")]
    CommandExecutionError(String),

    #[error("Process error: {0}")]
    ProcessError(String),

    #[error("Session {0} is busy")]
    SessionBusy(u64),

    #[error("Session not found for ID: {0}")]
    SessionNotFound(String),

    #[error("Service not found for ID: {0}")]
    ServiceNotFound(String),

    #[error("Terminal provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Host terminal error: {0}")]
    HostError(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Serde JSON error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("Reqwest HTTP error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("Operation timed out: {0}")]
    TimeoutError(String),

    #[error("Invalid input argument: {0}")]
    InvalidInputArgument(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),
}

impl AppError {
    /// Error code reported on the dispatcher surface.
    pub fn code(&self) -> i32 {
        match self {
            AppError::InvalidInputArgument(_)
            | AppError::InvalidPattern(_)
            | AppError::SerdeJsonError(_) => -32602,
            AppError::UnknownTool(_) => -32601,
            AppError::SessionNotFound(_) | AppError::ServiceNotFound(_) => -32004,
            AppError::SessionBusy(_) => -32005,
            _ => -32603,
        }
    }
}

impl From<regex::Error> for AppError {
    fn from(err: regex::Error) -> Self {
        AppError::InvalidPattern(err.to_string())
    }
}
