use merlin_core::errors::RepositoryError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<StoreError> for RepositoryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(msg) => RepositoryError::NotFound(msg),
            StoreError::Forbidden(msg) => RepositoryError::Forbidden(msg),
            other => RepositoryError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_to_repository_error() {
        let err: RepositoryError = StoreError::NotFound("session x".into()).into();
        assert!(matches!(err, RepositoryError::NotFound(m) if m == "session x"));

        let err: RepositoryError = StoreError::Database("locked".into()).into();
        assert!(matches!(err, RepositoryError::Storage(m) if m.contains("locked")));
    }
}
