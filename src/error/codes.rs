/// Error code registry for toolbridge
///
/// Error codes are organized by category:
/// - 1000-1999: Configuration errors
/// - 4000-4999: Execution errors
/// - 9000-9999: Other errors
#[allow(dead_code)]
pub struct ErrorCode;

impl ErrorCode {
    // Configuration errors (1000-1999)
    pub const CONFIG_GENERIC: u16 = 1000;
    pub const CONFIG_NOT_FOUND: u16 = 1001;
    pub const CONFIG_PARSE_ERROR: u16 = 1007;
    pub const CONFIG_VALIDATION_FAILED: u16 = 1008;

    // Execution errors (4000-4999)
    pub const EXEC_GENERIC: u16 = 4000;
    pub const EXEC_COMMAND_NOT_FOUND: u16 = 4001;
    pub const EXEC_SUBPROCESS_FAILED: u16 = 4003;
    pub const EXEC_INTERRUPTED: u16 = 4006;
    pub const EXEC_SPAWN_FAILED: u16 = 4007;
    pub const EXEC_OUTPUT_ERROR: u16 = 4008;
    pub const EXEC_PROTOCOL_VIOLATION: u16 = 4011;
    pub const EXEC_WORKER_CLOSED: u16 = 4012;

    // Other errors (9000-9999)
    pub const OTHER_GENERIC: u16 = 9000;
    pub const OTHER_INTERNAL: u16 = 9004;
}

/// Get a human-readable description for an error code
pub fn describe_error_code(code: u16) -> &'static str {
    match code {
        // Configuration errors
        1000 => "Generic configuration error",
        1001 => "Configuration file not found",
        1007 => "Failed to parse configuration",
        1008 => "Configuration validation failed",

        // Execution errors
        4000 => "Generic execution error",
        4001 => "Command not found",
        4003 => "Subprocess failed",
        4006 => "Command execution interrupted",
        4007 => "Failed to spawn subprocess",
        4008 => "Command output error",
        4011 => "Worker closed before completing the response",
        4012 => "Command serializer is no longer running",

        // Other errors
        9000 => "Generic error",
        9004 => "Internal error",

        _ => "Unknown error code",
    }
}
