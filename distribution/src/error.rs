use crate::blob::BlobError;
use crate::store::StoreError;

pub type Result<T, E = DistributionError> = std::result::Result<T, E>;

/// Errors surfaced by the distribution engine.
///
/// Everything except `Internal` carries a message meant for the caller.
#[derive(thiserror::Error, Debug)]
pub enum DistributionError {
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Validation(String),

    #[error("not modified")]
    NotModified,

    #[error("internal error")]
    Internal(#[source] InternalError),
}

#[derive(thiserror::Error, Debug)]
pub enum InternalError {
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("blob store error: {0}")]
    Blob(BlobError),
}

impl From<StoreError> for DistributionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => DistributionError::Conflict(msg),
            StoreError::NotFound(msg) => DistributionError::NotFound(msg),
            other => DistributionError::Internal(InternalError::Store(other)),
        }
    }
}

impl From<BlobError> for DistributionError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound(key) => {
                DistributionError::NotFound(format!("bundle not found: {key}"))
            }
            BlobError::InvalidKey(key) => {
                DistributionError::Validation(format!("invalid bundle key: {key}"))
            }
            BlobError::InvalidSignature => {
                DistributionError::Forbidden("upload signature is invalid or expired".into())
            }
            other => DistributionError::Internal(InternalError::Blob(other)),
        }
    }
}

impl DistributionError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        DistributionError::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        DistributionError::NotFound(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        DistributionError::Validation(msg.into())
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, DistributionError::Internal(_))
    }
}
