use std::sync::Arc;

use jwt_security::{AuthenticatedIdentity, TokenIssuer, TokenKind};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::db::{CredentialStore, SessionLedger};
use crate::error::{AuthError, AuthResult};
use crate::metrics::{self, LoginOutcome};
use crate::models::{LoginRequest, NewUser, RegisterRequest, User};
use crate::security::{hash_password, verify_password};

/// Tokens handed back by a successful login
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Result of a refresh: a new access token only
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshedAccess {
    pub access_token: String,
}

/// Orchestrates login, refresh and logout on top of the token issuer and the
/// session ledger.
///
/// Per user the lifecycle is `NoSession -> ActiveSession -> NoSession`; a
/// refresh never creates a ledger record.
pub struct AuthSessionManager {
    credentials: Arc<dyn CredentialStore>,
    ledger: Arc<dyn SessionLedger>,
    issuer: Arc<TokenIssuer>,
}

impl AuthSessionManager {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        ledger: Arc<dyn SessionLedger>,
        issuer: Arc<TokenIssuer>,
    ) -> Self {
        Self {
            credentials,
            ledger,
            issuer,
        }
    }

    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    /// Create an account after validating and hashing its credentials.
    pub async fn register(&self, request: &RegisterRequest) -> AuthResult<User> {
        request.validate()?;

        let password_hash = hash_password(&request.password)?;
        let user = self
            .credentials
            .create(NewUser {
                email: request.email.trim().to_string(),
                username: request.username.trim().to_string(),
                password_hash,
            })
            .await?;

        info!(user_id = %user.id, username = %user.username, "User registered");
        Ok(user)
    }

    /// Verify credentials, mint an access/refresh pair and record the session.
    ///
    /// The ledger write happens after minting and is not transactional with
    /// it: when it fails the error surfaces, the tokens remain valid and no
    /// session record exists.
    pub async fn login(&self, request: &LoginRequest) -> AuthResult<TokenPair> {
        request.validate()?;

        let user = match self
            .credentials
            .find_by_username_or_email(request.username_or_email.trim())
            .await?
        {
            Some(user) => user,
            None => {
                metrics::record_login(LoginOutcome::UnknownUser);
                return Err(AuthError::NotFound("User not found".to_string()));
            }
        };

        if let Err(err) = verify_password(&request.password, &user.password_hash) {
            if matches!(err, AuthError::Unauthorized(_)) {
                metrics::record_login(LoginOutcome::BadPassword);
                warn!(user_id = %user.id, "Login rejected: wrong password");
            }
            return Err(err);
        }

        let subject = user.subject();
        let access_token = self.issuer.issue_access(&subject, &user.username)?;
        let refresh_token = self.issuer.issue_refresh(&subject, &user.username)?;

        match self
            .ledger
            .save(&subject, &access_token, &refresh_token)
            .await
        {
            Ok(record) => {
                metrics::record_login(LoginOutcome::Success);
                info!(user_id = %subject, session_id = %record.id, "User logged in");
            }
            Err(err) => {
                metrics::record_login(LoginOutcome::PersistenceFailed);
                warn!(user_id = %subject, error = %err, "Tokens minted but session was not recorded");
                return Err(err);
            }
        }

        Ok(TokenPair {
            access_token,
            refresh_token,
        })
    }

    /// Mint a new access token for an identity produced by
    /// [`authenticate_refresh`](Self::authenticate_refresh). The ledger is untouched.
    pub async fn refresh(&self, identity: &AuthenticatedIdentity) -> AuthResult<RefreshedAccess> {
        let access_token = self
            .issuer
            .issue_access(&identity.user_id, identity.username_or_empty())?;

        info!(user_id = %identity.user_id, "Access token refreshed");
        Ok(RefreshedAccess { access_token })
    }

    /// Revoke the user's active session and hand back a 3 second receipt.
    pub async fn logout(&self, identity: &AuthenticatedIdentity) -> AuthResult<String> {
        let record = self
            .ledger
            .find_active_by_user(&identity.user_id)
            .await?
            .ok_or_else(|| AuthError::NotFound("No active session".to_string()))?;

        self.ledger.revoke(record.id).await?;
        metrics::record_session_revoked();

        let receipt = self.issuer.issue_short_lived(&identity.user_id)?;

        info!(user_id = %identity.user_id, session_id = %record.id, "User logged out");
        Ok(receipt)
    }

    /// Bearer guard: accepts access tokens only.
    pub fn authenticate_access(&self, token: &str) -> AuthResult<AuthenticatedIdentity> {
        Ok(self.issuer.authenticate(token, TokenKind::Access)?)
    }

    /// Refresh guard: verifies the refresh token and confirms its subject
    /// still has an account.
    pub async fn authenticate_refresh(&self, token: &str) -> AuthResult<AuthenticatedIdentity> {
        let claims = self.issuer.verify(token, TokenKind::Refresh)?;

        let user_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| AuthError::Unauthorized("Malformed token subject".to_string()))?;

        let user = self
            .credentials
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| AuthError::Unauthorized("Account no longer exists".to_string()))?;

        Ok(AuthenticatedIdentity::new(claims.sub, Some(user.username)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{InMemoryCredentialStore, InMemorySessionLedger};

    const TEST_ACCESS_SECRET: &str = "J8Kq2mPvRx4TnZs9YwLcGf7DhBe3Xa6W";
    const TEST_REFRESH_SECRET: &str =
        "y9K$mP2vRx#TnZ@s4Yw!cGf7Dh&e3Xa6Wq8Lj5BtNu1Zp0MkYhVgCxFbAsSdQwEr";

    fn manager() -> (AuthSessionManager, Arc<InMemorySessionLedger>) {
        let ledger = Arc::new(InMemorySessionLedger::new());
        let issuer = Arc::new(TokenIssuer::new(TEST_ACCESS_SECRET, TEST_REFRESH_SECRET).unwrap());
        let manager = AuthSessionManager::new(
            Arc::new(InMemoryCredentialStore::new()),
            ledger.clone(),
            issuer,
        );
        (manager, ledger)
    }

    fn register_request(username: &str) -> RegisterRequest {
        RegisterRequest {
            email: format!("{}@example.com", username),
            username: username.to_string(),
            password: "SecurePass123!".to_string(),
        }
    }

    #[tokio::test]
    async fn test_login_by_email() {
        let (manager, ledger) = manager();
        let user = manager.register(&register_request("alice")).await.unwrap();

        let pair = manager
            .login(&LoginRequest {
                username_or_email: "alice@example.com".into(),
                password: "SecurePass123!".into(),
            })
            .await
            .unwrap();

        let record = ledger
            .find_active_by_user(&user.id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.refresh_token, pair.refresh_token);
    }

    #[tokio::test]
    async fn test_register_rejects_weak_password() {
        let (manager, _) = manager();
        let mut request = register_request("bob");
        request.password = "weakpassword".into();

        let err = manager.register(&request).await.unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));
    }

    #[tokio::test]
    async fn test_access_guard_rejects_refresh_token() {
        let (manager, _) = manager();
        manager.register(&register_request("carol")).await.unwrap();
        let pair = manager
            .login(&LoginRequest {
                username_or_email: "carol".into(),
                password: "SecurePass123!".into(),
            })
            .await
            .unwrap();

        assert!(manager.authenticate_access(&pair.access_token).is_ok());
        let err = manager.authenticate_access(&pair.refresh_token).unwrap_err();
        assert!(matches!(err, AuthError::Token(_)));
        assert_eq!(err.status_code(), 401);
    }
}
