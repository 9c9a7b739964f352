//! REST API client module for the Gridee backend.
//!
//! This module provides the `ApiClient` for the login, registration and
//! social sign-in endpoints. The API uses JWT bearer token authentication;
//! tokens are held by the `SessionManager`.

pub mod client;
pub mod error;

pub use client::{ApiClient, AuthResponse, GoogleSignIn, Registration};
pub use error::ApiError;
