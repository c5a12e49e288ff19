//! Error code registry shared by the library and the binary.
//!
//! Library errors are typed (`ProcessError`); the numeric codes give the CLI a
//! stable `[E####]` prefix and a human description for each failure class.

pub mod codes;

pub use codes::{describe_error_code, ErrorCode};

/// Format an error message with its code prefix, as the binary prints it.
pub fn format_with_code(code: u16, message: impl std::fmt::Display) -> String {
    format!("[E{code:04}] {message}")
}
