use jwt_security::TokenError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid token: {0}")]
    Token(#[from] TokenError),

    #[error("Internal server error: {0}")]
    Internal(String),
}

pub type AuthResult<T> = std::result::Result<T, AuthError>;

impl AuthError {
    /// HTTP status a transport layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            AuthError::NotFound(_) => 404,
            AuthError::Unauthorized(_) | AuthError::Token(_) => 401,
            AuthError::Validation(_) => 400,
            AuthError::Conflict(_) => 409,
            AuthError::Persistence(_) | AuthError::Internal(_) => 500,
        }
    }
}

impl From<sqlx::Error> for AuthError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AuthError::NotFound("record not found".to_string()),
            other => AuthError::Persistence(other.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for AuthError {
    fn from(err: validator::ValidationErrors) -> Self {
        AuthError::Validation(err.to_string())
    }
}
