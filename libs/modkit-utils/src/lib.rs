#![forbid(unsafe_code)]

//! Small, dependency-light helpers shared across `modkit` crates.

#[cfg(feature = "humantime-serde")]
pub mod humantime_serde;

mod secret_string;

pub use secret_string::SecretString;
