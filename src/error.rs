use thiserror::Error;

use crate::types::Marketplace;

/// Cluster unreachable after the retry budget of one connect attempt.
///
/// `Clone` so the outcome of a shared connect attempt can be handed to every
/// caller waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cluster unreachable after {attempts} attempt(s): {reason}")]
pub struct ConnectionError {
    pub attempts: u32,
    pub reason: String,
}

/// A candidate key that matches neither the flat nor the trait-scoped shape.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("undecodable order key {key:?}: {reason}")]
pub struct DecodeError {
    pub key: String,
    pub reason: String,
}

impl DecodeError {
    pub fn new(key: &str, reason: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("order key does not belong to task {task_id} on {marketplace}")]
    KeyMismatch {
        task_id: String,
        marketplace: Marketplace,
    },

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("deadline of {0}ms exceeded")]
    Timeout(u64),
}

pub type TrackerResult<T> = Result<T, TrackerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_is_shared_verbatim() {
        let err = ConnectionError {
            attempts: 3,
            reason: "connection refused".to_string(),
        };
        let copy = err.clone();
        assert_eq!(err, copy);
        assert_eq!(
            TrackerError::from(copy).to_string(),
            "cluster unreachable after 3 attempt(s): connection refused"
        );
    }

    #[test]
    fn decode_error_keeps_raw_key() {
        let err = DecodeError::new("a:b", "expected 5 or 7 segments, found 2");
        assert_eq!(err.key, "a:b");
        assert!(TrackerError::from(err).to_string().contains("\"a:b\""));
    }
}
