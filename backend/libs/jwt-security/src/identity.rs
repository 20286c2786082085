//! Identity value handed from the token guards to the core services.

use serde::{Deserialize, Serialize};

use crate::Claims;

/// A caller whose bearer token has already been verified upstream.
///
/// Core operations receive this value explicitly and trust it verbatim;
/// they never re-derive identity from request data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedIdentity {
    pub user_id: String,
    pub username: Option<String>,
}

impl AuthenticatedIdentity {
    pub fn new(user_id: impl Into<String>, username: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username,
        }
    }

    /// Build the identity carried by a verified token.
    pub fn from_claims(claims: &Claims) -> Self {
        Self {
            user_id: claims.sub.clone(),
            username: claims.username.clone(),
        }
    }

    /// Username if the token carried one, otherwise the empty string.
    pub fn username_or_empty(&self) -> &str {
        self.username.as_deref().unwrap_or("")
    }
}
