//! Hoist Core - Foundational Types
//!
//! Error taxonomy, endpoint configuration and progress events shared by
//! the registry client and the command-line front end.

pub mod config;
pub mod error;
pub mod event;

// Re-export commonly used types
pub use config::{Credentials, EndpointConfig, Platform};
pub use error::{AuthErrorKind, HoistError, Result};
pub use event::{EventEmitter, Outcome, PullEvent, Stage};
