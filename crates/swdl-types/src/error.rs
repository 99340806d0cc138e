use thiserror::Error;

/// Failures reported by workflow and execution stores.
///
/// Defined here rather than in swdl-core so storage backends can produce it
/// without depending on the engine.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The backing store could not be reached (pool closed or timed out).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("query failed: {0}")]
    Query(String),

    /// A stored row could not be turned back into a domain value.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("record not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_their_detail() {
        assert_eq!(
            RepositoryError::Query("no such table: executions".into()).to_string(),
            "query failed: no such table: executions"
        );
        assert_eq!(
            RepositoryError::Corrupt("step status 'bogus'".into()).to_string(),
            "corrupt record: step status 'bogus'"
        );
    }

    #[test]
    fn conflict_names_the_record() {
        let err = RepositoryError::Conflict("workflow 'etl' already exists".to_string());
        assert!(err.to_string().contains("etl"));
    }
}
