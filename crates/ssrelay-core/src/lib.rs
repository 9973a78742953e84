//! `ssrelay` Core Library
//!
//! Shared functionality for `ssrelay` components:
//! - `ss://` link encoding and decoding
//! - Random port allocation with collision retry
//! - Relay data model and expiry policy
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod error;
pub mod expiry;
pub mod link;
pub mod model;
pub mod ports;
pub mod secret;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use expiry::ExpiryPolicy;
pub use link::{LinkError, RelayLink};
pub use model::{BackendAuth, Cipher, Endpoint, LifecycleState, RelayCredential, RelayRecord};
pub use ports::{AllocError, PortAllocator};
