//! Secret handling utilities.
//!
//! Re-exports secrecy types so callers can expose the database URL
//! without depending on secrecy directly.

pub use secrecy::{ExposeSecret, SecretString};
