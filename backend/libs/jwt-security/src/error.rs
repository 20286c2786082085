//! Error types for token issuance and verification.

use thiserror::Error;

use crate::{KeyRole, TokenKind};

/// Result type alias for token operations.
pub type TokenResult<T> = Result<T, TokenError>;

/// Errors raised while signing or verifying tokens.
///
/// Every verification failure maps to the same caller-facing class
/// (an invalid token); the variants exist for logging and tests.
#[derive(Error, Debug)]
pub enum TokenError {
    /// Signature, encoding, or claim set did not check out
    #[error("Invalid token: {0}")]
    Invalid(String),

    /// Token was well formed but its `exp` is in the past
    #[error("Token expired")]
    Expired,

    /// Token was signed for a different purpose than the one requested
    #[error("Token kind mismatch: expected {expected}, found {found}")]
    KindMismatch { expected: TokenKind, found: TokenKind },

    /// Signing failed (should only happen with a broken key)
    #[error("Failed to encode token: {0}")]
    Encoding(String),

    /// A configured signing secret failed the strength check
    #[error("{0} secret is too weak")]
    WeakSecret(KeyRole),

    /// A required secret was not present in the environment
    #[error("{0} environment variable not set")]
    MissingSecret(&'static str),
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::ExpiredSignature => TokenError::Expired,
            _ => TokenError::Invalid(err.to_string()),
        }
    }
}
