//! Error taxonomy shared by every server component.

use shared::{ErrorKind, RpcError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(#[from] fjall::Error),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record under {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: bincode::Error,
    },
    #[error("failed to encode record: {0}")]
    Encode(bincode::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("token expired")]
    Expired,
    #[error("unknown user {0}")]
    UnknownUser(String),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{0} already has a live session")]
    AlreadyConnected(String),
    #[error("player {0} already exists")]
    AlreadyExists(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("username {0} is taken")]
    UsernameTaken(String),
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<tokio::task::JoinError> for ServerError {
    fn from(e: tokio::task::JoinError) -> Self {
        ServerError::Internal(e.to_string())
    }
}

impl From<&ServerError> for RpcError {
    fn from(err: &ServerError) -> Self {
        let kind = match err {
            ServerError::Validation(_) => ErrorKind::ValidationFailed,
            ServerError::AlreadyConnected(_) => ErrorKind::AlreadyConnected,
            ServerError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            ServerError::NotFound(_) => ErrorKind::NotFound,
            ServerError::UsernameTaken(_) => ErrorKind::UsernameTaken,
            ServerError::InvalidCredentials => ErrorKind::InvalidCredentials,
            ServerError::Auth(AuthError::Expired) => ErrorKind::TokenExpired,
            ServerError::Auth(_) => ErrorKind::Unauthenticated,
            ServerError::Storage(_) => ErrorKind::Storage,
            ServerError::Internal(_) => ErrorKind::Internal,
        };
        RpcError::new(kind, err.to_string())
    }
}

pub type Result<T, E = ServerError> = std::result::Result<T, E>;
