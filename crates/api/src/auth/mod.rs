//! Authentication for the live chat API
//!
//! Tokens are issued by the identity service; this module only verifies them
//! and resolves the caller's role from the `users` profile cache.

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtError, JwtManager};
pub use middleware::{require_auth, AuthState, Identity};
