use tenantry_store::error::StoreError;

const UNIQUE_VIOLATION: &str = "23505";

pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db_error) if db_error.code().as_deref() == Some(UNIQUE_VIOLATION)
    )
}

/// Map a driver error onto the store taxonomy.
pub(crate) fn map_sqlx(error: sqlx::Error) -> StoreError {
    if is_unique_violation(&error) {
        return StoreError::UniqueViolation(error.to_string());
    }
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Connection(error.to_string())
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(error.to_string())
        }
        other => StoreError::Backend(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_is_retryable() {
        let err = map_sqlx(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, StoreError::Connection(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn row_not_found_is_backend() {
        assert!(matches!(
            map_sqlx(sqlx::Error::RowNotFound),
            StoreError::Backend(_)
        ));
    }
}
