// Error types
pub mod error;

// TOML configuration and environment overrides
pub mod config;

// Token persistence
pub mod credentials;

// OAuth2 token lifecycle
pub mod oauth;

// STH history client
pub mod history;

// Configured services and the trigger flow
pub mod service;

// HTTP endpoints
pub mod api;

pub use error::{Error, Result};
