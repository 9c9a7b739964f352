//! Authentication module for the device session.
//!
//! This module provides:
//! - `SessionManager`: token and identity persistence with lazy expiry
//! - `claims`: unverified read of a token's `exp` claim
//!
//! A session expires at the token's `exp` claim when it can be decoded,
//! otherwise 24 hours after it was saved.

pub mod claims;
pub mod session;

pub use claims::decode_expiry_claim;
pub use session::{
    ExpirySource, SessionError, SessionManager, SessionSnapshot, SessionStatus, FALLBACK_TTL_MS,
};
