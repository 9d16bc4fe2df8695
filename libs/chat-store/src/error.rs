use chat_core::ChatError;

/// Store-side error, kept deliberately small: the request/session surfaces
/// never see anything beyond "not found", "conflict" or "everything else"
/// (§7 "Store errors are logged ... and surfaced as INTERNAL_ERROR unless
/// recognizable (unique violation → CONFLICT)"). This is the single
/// conversion helper §9 asks for at this boundary.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ChatError::NotFound { what },
            StoreError::Conflict(message) => ChatError::Conflict { message },
            StoreError::Backend(e) => ChatError::Internal(e),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Recognizes a Postgres unique-violation (SQLSTATE 23505) so the backend
/// can surface `StoreError::Conflict` instead of a generic internal error.
pub fn classify_sqlx_error(err: sqlx::Error, context: &str) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return StoreError::Conflict(format!("{context}: {}", db_err.message()));
        }
    }
    StoreError::Backend(anyhow::Error::new(err).context(context.to_string()))
}
