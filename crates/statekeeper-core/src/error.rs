use std::path::PathBuf;
use thiserror::Error;

/// Result alias for core operations.
pub type StatekeeperResult<T> = Result<T, StatekeeperError>;

#[derive(Error, Debug)]
pub enum StatekeeperError {
    #[error("[SK1000] io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[SK1001] toml config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("[SK1002] yaml config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("[SK1100] configuration error: {0}")]
    InvalidConfig(String),

    #[error("[SK1200] desired state is not well-formed: {0}")]
    StateSyntax(String),

    #[error("[SK1201] desired state validation failed at `{field}`: {message}")]
    Validation { field: String, message: String },

    #[error("[SK1202] desired state file not found at {}", .0.display())]
    StateNotFound(PathBuf),

    #[error("[SK2000] cannot read live {subsystem} state: {reason}")]
    LiveRead {
        subsystem: &'static str,
        reason: String,
    },

    #[error("[SK2001] provider error: {0}")]
    Provider(String),

    #[error("[SK3000] `{key}` is not currently BLOCKED in the plan; re-evaluate before approving")]
    NotBlocked { key: String },

    #[error("[SK3001] unknown resource kind `{0}` (expected pool, dataset or share)")]
    UnknownKind(String),

    #[error("[SK4000] database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl StatekeeperError {
    pub fn code(&self) -> &'static str {
        match self {
            StatekeeperError::Io(_) => "SK1000",
            StatekeeperError::Toml(_) => "SK1001",
            StatekeeperError::Yaml(_) => "SK1002",
            StatekeeperError::InvalidConfig(_) => "SK1100",
            StatekeeperError::StateSyntax(_) => "SK1200",
            StatekeeperError::Validation { .. } => "SK1201",
            StatekeeperError::StateNotFound(_) => "SK1202",
            StatekeeperError::LiveRead { .. } => "SK2000",
            StatekeeperError::Provider(_) => "SK2001",
            StatekeeperError::NotBlocked { .. } => "SK3000",
            StatekeeperError::UnknownKind(_) => "SK3001",
            StatekeeperError::Database(_) => "SK4000",
        }
    }

    /// True for errors caused by the desired-state document itself.
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            StatekeeperError::StateSyntax(_)
                | StatekeeperError::Validation { .. }
                | StatekeeperError::StateNotFound(_)
        )
    }

    pub(crate) fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        StatekeeperError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}
