use thiserror::Error;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(what: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(what, id.to_string())
    }

    /// Map to an HTTP status code for API responses.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(..) => 404,
            Self::Conflict(_) => 409,
            Self::Invalid(_) => 400,
            Self::Database(_) | Self::Serialize(_) => 500,
        }
    }
}

/// Map a PostgreSQL unique violation (23505) to `Conflict`.
pub(crate) fn map_unique_violation(e: sqlx::Error, what: &str) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.code().as_deref() == Some("23505") {
            return StoreError::Conflict(format!("{} already exists", what));
        }
    }
    StoreError::Database(e)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(StoreError::not_found("agent", "abc").status_code(), 404);
        assert_eq!(StoreError::Conflict("dup".to_string()).status_code(), 409);
        assert_eq!(StoreError::Invalid("bad".to_string()).status_code(), 400);
        assert_eq!(StoreError::Database(sqlx::Error::PoolClosed).status_code(), 500);
    }

    #[test]
    fn test_not_found_message_names_the_object() {
        let err = StoreError::not_found("session", "0000-1111");
        assert!(err.to_string().contains("session"));
        assert!(err.to_string().contains("0000-1111"));
    }
}
