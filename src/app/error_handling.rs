//! Error handling utilities
//!
//! Maps library errors to `[E####]` prefixed messages and exit codes.

use tracing::error;

use crate::config::ConfigError;
use crate::error::{describe_error_code, format_with_code, ErrorCode};
use crate::subprocess::ProcessError;

/// The registry code for an error, looking through `anyhow` context.
pub fn error_code(error: &anyhow::Error) -> u16 {
    for cause in error.chain() {
        if let Some(err) = cause.downcast_ref::<ProcessError>() {
            return err.code();
        }
        if let Some(err) = cause.downcast_ref::<ConfigError>() {
            return err.code();
        }
    }
    ErrorCode::OTHER_GENERIC
}

/// Process exit code for an error. Mirrors the tool's own exit code when the
/// failure came from a subprocess.
pub fn exit_code(error: &anyhow::Error) -> i32 {
    let failure_code = error
        .chain()
        .find_map(|cause| cause.downcast_ref::<ProcessError>())
        .and_then(|err| err.failure())
        .and_then(|failure| failure.exit_code());

    match failure_code {
        Some(code) if code != 0 => code,
        _ => 1,
    }
}

/// Handle fatal errors and exit with appropriate status code
///
/// # Verbose Mode Behavior
/// - `verbose = 0`: Coded message only
/// - `verbose >= 1`: Includes the code description and the error chain
pub fn handle_fatal_error(error: anyhow::Error, verbose: u8) -> ! {
    error!("Fatal error: {:#}", error);

    let code = error_code(&error);
    eprintln!("{}", format_with_code(code, format!("{error:#}")));

    if verbose >= 1 {
        eprintln!("\n{}", describe_error_code(code));
        eprintln!("\nError chain:");
        for (i, cause) in error.chain().enumerate() {
            eprintln!("  {}: {}", i, cause);
        }
    }

    std::process::exit(exit_code(&error))
}
