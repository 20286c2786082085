//! Auth service: account registration, login, token refresh and logout.
//!
//! The core is [`AuthSessionManager`], which mints tokens through
//! [`jwt_security::TokenIssuer`] and records sessions in a [`SessionLedger`].

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod security;
pub mod services;

pub use db::{
    CredentialStore, InMemoryCredentialStore, InMemorySessionLedger, PgCredentialStore,
    PgSessionLedger, SessionLedger,
};
pub use error::{AuthError, AuthResult};
pub use models::{LoginRequest, RegisterRequest, SessionRecord, User};
pub use services::{AuthSessionManager, RefreshedAccess, TokenPair};
