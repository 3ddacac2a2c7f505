use thiserror::Error;

/// Engine error taxonomy. Every variant is recoverable at the request
/// boundary; nothing here is fatal to the process.
#[derive(Debug, Error)]
pub enum TimerError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl TimerError {
    /// HTTP-style status class for the error.
    pub fn status_code(&self) -> u16 {
        match self {
            TimerError::NotFound(_) => 404,
            TimerError::InvalidState(_) => 400,
            TimerError::Conflict(_) => 409,
            TimerError::Validation(_) => 422,
            TimerError::Storage(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_error_classes() {
        assert_eq!(TimerError::NotFound("x".into()).status_code(), 404);
        assert_eq!(TimerError::InvalidState("x".into()).status_code(), 400);
        assert_eq!(TimerError::Conflict("x".into()).status_code(), 409);
        assert_eq!(TimerError::Validation("x".into()).status_code(), 422);
        assert_eq!(
            TimerError::Storage(rusqlite::Error::InvalidQuery).status_code(),
            500
        );
    }
}
