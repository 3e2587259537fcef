use thiserror::Error;

/// Dialer engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    /// Campaign is missing something it needs before it can dial
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Rejected input (bad phone number, bad timezone, bad pacing...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Run-state or lead-status change not allowed from the current state
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Telephony provider refused or failed a request
    #[error("Provider error: {0}")]
    Provider(String),

    /// Account-wide or campaign concurrency ceiling reached
    #[error("Capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Create a new Configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new InvalidInput error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new InvalidTransition error
    pub fn invalid_transition<S: Into<String>>(msg: S) -> Self {
        Self::InvalidTransition(msg.into())
    }

    /// Create a new NotFound error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new Provider error
    pub fn provider<S: Into<String>>(msg: S) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a new CapacityExhausted error
    pub fn capacity_exhausted<S: Into<String>>(msg: S) -> Self {
        Self::CapacityExhausted(msg.into())
    }

    /// Create a new Internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Short machine-readable code, used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::InvalidInput(_) => "invalid_input",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::NotFound(_) => "not_found",
            Self::Provider(_) => "provider",
            Self::CapacityExhausted(_) => "capacity_exhausted",
            Self::Database(_) => "database",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {}", err))
    }
}

/// Result type for dialer engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
