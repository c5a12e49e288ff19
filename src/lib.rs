//! # toolbridge
//!
//! Drives an external command-line tool. Most commands run through one
//! long-lived worker process that accepts NUL-framed JSON requests on stdin;
//! commands that need their own lifetime run as one-shot processes, either
//! collecting stdout or streaming NUL-delimited JSON records.
//!
//! ## Modules
//!
//! - `subprocess` - Worker protocol, command serializer, one-shot runners and the stream splitter
//! - `client` - `ToolClient`, the facade used by applications
//! - `config` - Tool configuration loaded from TOML and the environment
//! - `error` - Error code registry
//! - `app` - Binary-side logging and error reporting
pub mod app;
pub mod client;
pub mod config;
pub mod error;
pub mod subprocess;

pub use client::{CredentialProvider, ToolClient};
pub use config::ToolConfig;
pub use subprocess::ProcessError;
