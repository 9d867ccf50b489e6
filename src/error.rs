use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classification for everything the engine can surface.
///
/// Retryability is a property of the category and can be overridden per
/// instance with [`EngineError::with_retryable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Auth,
    RateLimited,
    Timeout,
    Service,
    InvalidInput,
    Configuration,
    NotFound,
    Internal,
}

impl ErrorCategory {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::Timeout | Self::Service)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auth => "AUTH",
            Self::RateLimited => "RATE_LIMITED",
            Self::Timeout => "TIMEOUT",
            Self::Service => "SERVICE",
            Self::InvalidInput => "INVALID_INPUT",
            Self::Configuration => "CONFIGURATION",
            Self::NotFound => "NOT_FOUND",
            Self::Internal => "INTERNAL",
        };
        f.write_str(name)
    }
}

/// The engine-wide error type: a category, a message, an optional free-form
/// context string (task name, stage, path) and an optional source cause.
#[derive(Debug, Error)]
#[error("{category}: {message}")]
pub struct EngineError {
    pub category: ErrorCategory,
    pub message: String,
    pub context: Option<String>,
    retryable: Option<bool>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            context: None,
            retryable: None,
            source: None,
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Auth, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::RateLimited, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, message)
    }

    pub fn service(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Service, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::InvalidInput, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Configuration, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, message)
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable.unwrap_or_else(|| self.category.is_retryable())
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        Self::internal("storage operation failed").with_source(e)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::internal("JSON (de)serialization failed").with_source(e)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::internal("I/O operation failed").with_source(e)
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::timeout("HTTP request timed out").with_source(e)
        } else {
            Self::service("HTTP request failed").with_source(e)
        }
    }
}
