//! Roadworks Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared plumbing used by every roadworks workspace member.
//!
//! # Overview
//!
//! - **Logging**: tracing subscriber setup driven by [`logging::LogConfig`]
//! - **Secrets**: the credential lookup that feeds warehouse configuration
//! - **Errors**: the error type for the two modules above
//!
//! # Example
//!
//! ```no_run
//! use roadworks_common::secrets::{EnvSecretSource, SecretSource};
//!
//! fn warehouse_token() -> roadworks_common::Result<String> {
//!     let secrets = EnvSecretSource::new().get_secrets(&["motherduck_token"])?;
//!     Ok(secrets["motherduck_token"].clone())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod secrets;

// Re-export commonly used types
pub use error::{CommonError, Result};
