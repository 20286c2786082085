//! JWT issuance and verification for the session-token lifecycle
//!
//! **Token kinds**:
//! - `Access`: short-lived credential (300s), signed with the access secret
//! - `Refresh`: long-lived credential (7 days), signed with the refresh secret
//! - `LogoutReceipt`: 3 second receipt proving a revocation, signed with the
//!   access secret but never accepted where an access token is expected
//!
//! Every token carries a `typ` claim naming its kind and a `jti` so two tokens
//! minted within the same second never collide.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

mod error;
pub mod identity;
pub mod secret_validation;

pub use error::{TokenError, TokenResult};
pub use identity::AuthenticatedIdentity;
pub use secret_validation::{validate_secret_strength, SecretStrength};

const ACCESS_TOKEN_TTL_SECS: i64 = 300;
const REFRESH_TOKEN_TTL_DAYS: i64 = 7;
const LOGOUT_RECEIPT_TTL_SECS: i64 = 3;

/// No clock-skew tolerance: a 3 second receipt must really expire after 3 seconds
const DEFAULT_VALIDATION_LEEWAY: u64 = 0;

const JWT_ALGORITHM: Algorithm = Algorithm::HS256;

/// Purpose a token was minted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
    LogoutReceipt,
}

impl TokenKind {
    /// Lifetime embedded in the `exp` claim.
    pub fn ttl(self) -> Duration {
        match self {
            TokenKind::Access => Duration::seconds(ACCESS_TOKEN_TTL_SECS),
            TokenKind::Refresh => Duration::days(REFRESH_TOKEN_TTL_DAYS),
            TokenKind::LogoutReceipt => Duration::seconds(LOGOUT_RECEIPT_TTL_SECS),
        }
    }

    /// Which secret signs this kind.
    pub fn key_role(self) -> KeyRole {
        match self {
            TokenKind::Access | TokenKind::LogoutReceipt => KeyRole::Access,
            TokenKind::Refresh => KeyRole::Refresh,
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
            TokenKind::LogoutReceipt => "logout_receipt",
        };
        f.write_str(name)
    }
}

/// The two process-wide signing secrets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    Access,
    Refresh,
}

impl fmt::Display for KeyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyRole::Access => f.write_str("access"),
            KeyRole::Refresh => f.write_str("refresh"),
        }
    }
}

/// JWT claims shared by every token kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// Username, absent on logout receipts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// JWT ID, unique per minted token
    pub jti: String,
    /// Token kind
    pub typ: TokenKind,
}

#[derive(Clone)]
struct SigningKey {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SigningKey {
    fn from_secret(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

/// Stateless signer/verifier for access, refresh and receipt tokens.
///
/// Build it once at startup and share it behind an `Arc`; all operations are
/// synchronous and side-effect free.
#[derive(Clone)]
pub struct TokenIssuer {
    access: SigningKey,
    refresh: SigningKey,
    leeway: u64,
}

impl TokenIssuer {
    /// Create an issuer from the two HS256 secrets.
    ///
    /// Secrets classified as [`SecretStrength::Weak`] are rejected.
    pub fn new(access_secret: &str, refresh_secret: &str) -> TokenResult<Self> {
        check_secret(access_secret, KeyRole::Access)?;
        check_secret(refresh_secret, KeyRole::Refresh)?;

        info!("Token issuer initialized with HS256");

        Ok(Self {
            access: SigningKey::from_secret(access_secret),
            refresh: SigningKey::from_secret(refresh_secret),
            leeway: DEFAULT_VALIDATION_LEEWAY,
        })
    }

    /// Initialize from `ACCESS_SECRET` and `REFRESH_SECRET`.
    pub fn from_env() -> TokenResult<Self> {
        let access = Zeroizing::new(
            std::env::var("ACCESS_SECRET").map_err(|_| TokenError::MissingSecret("ACCESS_SECRET"))?,
        );
        let refresh = Zeroizing::new(
            std::env::var("REFRESH_SECRET")
                .map_err(|_| TokenError::MissingSecret("REFRESH_SECRET"))?,
        );

        Self::new(&access, &refresh)
    }

    /// Override the clock-skew tolerance applied to `exp`.
    pub fn with_leeway(mut self, seconds: u64) -> Self {
        self.leeway = seconds;
        self
    }

    /// Access token (300s) carrying `sub` and `username`
    pub fn issue_access(&self, subject: &str, username: &str) -> TokenResult<String> {
        self.issue(TokenKind::Access, subject, Some(username))
    }

    /// Refresh token (7 days) carrying `sub` and `username`
    pub fn issue_refresh(&self, subject: &str, username: &str) -> TokenResult<String> {
        self.issue(TokenKind::Refresh, subject, Some(username))
    }

    /// Logout receipt (3s) carrying only `sub`
    pub fn issue_short_lived(&self, subject: &str) -> TokenResult<String> {
        self.issue(TokenKind::LogoutReceipt, subject, None)
    }

    fn issue(&self, kind: TokenKind, subject: &str, username: Option<&str>) -> TokenResult<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_string(),
            username: username.map(str::to_string),
            iat: now.timestamp(),
            exp: (now + kind.ttl()).timestamp(),
            jti: Uuid::new_v4().to_string(),
            typ: kind,
        };

        encode(
            &Header::new(JWT_ALGORITHM),
            &claims,
            &self.key(kind.key_role()).encoding,
        )
        .map_err(|e| TokenError::Encoding(e.to_string()))
    }

    /// Verify signature, expiry and kind, returning the embedded claims.
    ///
    /// The key is chosen from `expected`, so a refresh token presented as an
    /// access token fails on its signature, and a logout receipt presented as
    /// an access token fails on its `typ` claim.
    pub fn verify(&self, token: &str, expected: TokenKind) -> TokenResult<Claims> {
        let mut validation = Validation::new(JWT_ALGORITHM);
        validation.validate_exp = true;
        validation.leeway = self.leeway;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let data = decode::<Claims>(token, &self.key(expected.key_role()).decoding, &validation)?;
        let claims = data.claims;

        if claims.typ != expected {
            warn!(expected = %expected, found = %claims.typ, "Token presented for the wrong purpose");
            return Err(TokenError::KindMismatch {
                expected,
                found: claims.typ,
            });
        }

        if claims.jti.trim().is_empty() {
            return Err(TokenError::Invalid("missing jti claim".to_string()));
        }

        Ok(claims)
    }

    /// Verify a token and convert it into the identity the core services trust.
    pub fn authenticate(&self, token: &str, expected: TokenKind) -> TokenResult<AuthenticatedIdentity> {
        self.verify(token, expected)
            .map(|claims| AuthenticatedIdentity::from_claims(&claims))
    }

    fn key(&self, role: KeyRole) -> &SigningKey {
        match role {
            KeyRole::Access => &self.access,
            KeyRole::Refresh => &self.refresh,
        }
    }
}

fn check_secret(secret: &str, role: KeyRole) -> TokenResult<()> {
    match validate_secret_strength(secret) {
        SecretStrength::Weak => Err(TokenError::WeakSecret(role)),
        SecretStrength::Acceptable => {
            warn!(key = %role, "Signing secret is acceptable but below the recommended length");
            Ok(())
        }
        SecretStrength::Strong => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const TEST_ACCESS_SECRET: &str = "J8Kq2mPvRx4TnZs9YwLcGf7DhBe3Xa6W";
    const TEST_REFRESH_SECRET: &str =
        "y9K$mP2vRx#TnZ@s4Yw!cGf7Dh&e3Xa6Wq8Lj5BtNu1Zp0MkYhVgCxFbAsSdQwEr";

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(TEST_ACCESS_SECRET, TEST_REFRESH_SECRET).unwrap()
    }

    fn sign_with(secret: &str, claims: &Claims) -> String {
        encode(
            &Header::new(JWT_ALGORITHM),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_issue_and_verify_access_token() {
        let issuer = issuer();
        let token = issuer.issue_access("user-1", "alice").unwrap();

        let claims = issuer.verify(&token, TokenKind::Access).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.username.as_deref(), Some("alice"));
        assert_eq!(claims.typ, TokenKind::Access);
        assert_eq!(claims.exp - claims.iat, ACCESS_TOKEN_TTL_SECS);
        assert!(!claims.jti.is_empty());
    }

    #[test]
    fn test_refresh_token_lives_seven_days() {
        let issuer = issuer();
        let token = issuer.issue_refresh("user-1", "alice").unwrap();

        let claims = issuer.verify(&token, TokenKind::Refresh).unwrap();
        assert_eq!(claims.exp - claims.iat, 7 * 24 * 60 * 60);
    }

    #[test]
    fn test_refresh_token_rejected_as_access() {
        let issuer = issuer();
        let token = issuer.issue_refresh("user-1", "alice").unwrap();

        let err = issuer.verify(&token, TokenKind::Access).unwrap_err();
        assert!(matches!(err, TokenError::Invalid(_)));
    }

    #[test]
    fn test_logout_receipt_is_short_lived_and_not_an_access_token() {
        let issuer = issuer();
        let receipt = issuer.issue_short_lived("user-1").unwrap();

        let claims = issuer.verify(&receipt, TokenKind::LogoutReceipt).unwrap();
        assert_eq!(claims.exp - claims.iat, LOGOUT_RECEIPT_TTL_SECS);
        assert!(claims.username.is_none());

        let err = issuer.verify(&receipt, TokenKind::Access).unwrap_err();
        assert!(matches!(
            err,
            TokenError::KindMismatch {
                expected: TokenKind::Access,
                found: TokenKind::LogoutReceipt
            }
        ));
    }

    #[test]
    fn test_tokens_are_unique_within_the_same_second() {
        let issuer = issuer();
        let a = issuer.issue_access("user-1", "alice").unwrap();
        let b = issuer.issue_access("user-1", "alice").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_expired_token_fails() {
        let issuer = issuer();
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: "user-1".to_string(),
            username: Some("alice".to_string()),
            iat: now - 600,
            exp: now - 10,
            jti: Uuid::new_v4().to_string(),
            typ: TokenKind::Access,
        };
        let token = sign_with(TEST_ACCESS_SECRET, &claims);

        let err = issuer.verify(&token, TokenKind::Access).unwrap_err();
        assert!(matches!(err, TokenError::Expired));
    }

    #[test]
    fn test_leeway_tolerates_clock_skew() {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: "user-1".to_string(),
            username: None,
            iat: now - 300,
            exp: now - 10,
            jti: Uuid::new_v4().to_string(),
            typ: TokenKind::Access,
        };
        let token = sign_with(TEST_ACCESS_SECRET, &claims);

        assert!(issuer().verify(&token, TokenKind::Access).is_err());

        let lenient = issuer().with_leeway(60);
        let verified = lenient.verify(&token, TokenKind::Access).unwrap();
        assert_eq!(verified.sub, "user-1");

        let strict = issuer().with_leeway(5);
        assert!(matches!(
            strict.verify(&token, TokenKind::Access),
            Err(TokenError::Expired)
        ));
    }

    #[test]
    fn test_tampered_token_fails() {
        let issuer = issuer();
        let token = issuer.issue_access("user-1", "alice").unwrap();

        let forged_claims = Claims {
            sub: "user-2".to_string(),
            username: Some("mallory".to_string()),
            iat: Utc::now().timestamp(),
            exp: Utc::now().timestamp() + 300,
            jti: Uuid::new_v4().to_string(),
            typ: TokenKind::Access,
        };
        let forged = sign_with("some-other-secret-that-nobody-configured!", &forged_claims);
        assert!(issuer.verify(&forged, TokenKind::Access).is_err());

        // Swap the payload of a genuine token for the forged one
        let genuine: Vec<&str> = token.split('.').collect();
        let forged_parts: Vec<&str> = forged.split('.').collect();
        let spliced = format!("{}.{}.{}", genuine[0], forged_parts[1], genuine[2]);
        assert!(issuer.verify(&spliced, TokenKind::Access).is_err());
    }

    #[test]
    fn test_authenticate_yields_identity() {
        let issuer = issuer();
        let token = issuer.issue_access("user-7", "bob").unwrap();

        let identity = issuer.authenticate(&token, TokenKind::Access).unwrap();
        assert_eq!(identity, AuthenticatedIdentity::new("user-7", Some("bob".to_string())));
    }

    #[test]
    fn test_weak_secret_rejected() {
        let err = TokenIssuer::new("short", TEST_REFRESH_SECRET).err().unwrap();
        assert!(matches!(err, TokenError::WeakSecret(KeyRole::Access)));

        let err = TokenIssuer::new(TEST_ACCESS_SECRET, "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")
            .err()
            .unwrap();
        assert!(matches!(err, TokenError::WeakSecret(KeyRole::Refresh)));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("ACCESS_SECRET", TEST_ACCESS_SECRET);
        std::env::set_var("REFRESH_SECRET", TEST_REFRESH_SECRET);
        let issuer = TokenIssuer::from_env().unwrap();
        let token = issuer.issue_access("user-1", "alice").unwrap();
        assert!(issuer.verify(&token, TokenKind::Access).is_ok());

        std::env::remove_var("REFRESH_SECRET");
        let err = TokenIssuer::from_env().err().unwrap();
        assert!(matches!(err, TokenError::MissingSecret("REFRESH_SECRET")));
        std::env::remove_var("ACCESS_SECRET");
    }
}
