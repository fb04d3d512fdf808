//! Dargah Common Library
//!
//! Shared types for the dargah proxy: user roles, token claims,
//! environment configuration and the shared error enum.

pub mod config;
pub mod error;
pub mod roles;

// Re-export commonly used types
pub use config::Config;
pub use error::{DargahError, Result};
pub use roles::{Role, TokenClaims};
