//! Gridee core library.
//!
//! Client-side plumbing shared by every Gridee front-end:
//!
//! - `auth`: the `SessionManager` that owns the bearer token and identity
//!   of the current device session, with lazy expiry
//! - `store`: durable key-value stores the session is persisted to
//! - `clock`: injectable wall clock used for expiry decisions
//! - `api`: REST client for the Gridee auth endpoints
//! - `config`: user configuration (API URL, store backend)

pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod store;

pub use api::{ApiClient, ApiError};
pub use auth::{SessionError, SessionManager, SessionSnapshot, SessionStatus};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, StoreBackend};
pub use store::{Edit, FileStore, KeyValueStore, KeyringStore, MemoryStore, StoreError};
