/// Data models for authentication
pub mod session;
pub mod user;

pub use session::SessionRecord;
pub use user::{LoginRequest, NewUser, RegisterRequest, User};
