//! Shared types for the CRM gateway crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
