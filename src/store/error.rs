use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("entry '{key}' in map '{map}' changed since it was read")]
    Conflict { map: String, key: String },

    #[error("lock on '{key}' in map '{map}' is not held by the caller")]
    LockNotHeld { map: String, key: String },

    #[error("map '{0}' is already registered with a different value type")]
    TypeMismatch(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
