//! Secret handling utilities.
//!
//! Re-exports secrecy types and provides helpers for working with
//! credentials in event-dispatcher.

pub use secrecy::{ExposeSecret, SecretString};

/// Copy a secret without exposing it to logs.
pub fn clone_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_owned())
}

/// Placeholder shown instead of a secret value.
pub fn redact(secret: Option<&SecretString>) -> &'static str {
    match secret {
        Some(_) => "<redacted>",
        None => "-",
    }
}
