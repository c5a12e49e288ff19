use crate::error::ErrorCode;

use super::failure::StructuredFailure;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Command not found: {0}")]
    ToolNotFound(String),

    #[error("Failed to start {program}: {source}")]
    LaunchFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    ProtocolViolation(Box<StructuredFailure>),

    #[error("{0}")]
    NonZeroExit(Box<StructuredFailure>),

    #[error("{message}")]
    Cancelled { message: String, silent: bool },

    #[error("Parsing output of {description} failed: {message}")]
    OutputParse {
        description: String,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command serializer is no longer running")]
    ServerClosed,

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl ProcessError {
    pub fn code(&self) -> u16 {
        match self {
            ProcessError::ToolNotFound(_) => ErrorCode::EXEC_COMMAND_NOT_FOUND,
            ProcessError::LaunchFailed { .. } => ErrorCode::EXEC_SPAWN_FAILED,
            ProcessError::ProtocolViolation(_) => ErrorCode::EXEC_PROTOCOL_VIOLATION,
            ProcessError::NonZeroExit(_) => ErrorCode::EXEC_SUBPROCESS_FAILED,
            ProcessError::Cancelled { .. } => ErrorCode::EXEC_INTERRUPTED,
            ProcessError::OutputParse { .. } => ErrorCode::EXEC_OUTPUT_ERROR,
            ProcessError::Io(_) => ErrorCode::EXEC_GENERIC,
            ProcessError::ServerClosed => ErrorCode::EXEC_WORKER_CLOSED,
            ProcessError::InternalError { .. } => ErrorCode::OTHER_INTERNAL,
        }
    }

    /// The structured failure behind this error, if there is one.
    pub fn failure(&self) -> Option<&StructuredFailure> {
        match self {
            ProcessError::ProtocolViolation(failure) | ProcessError::NonZeroExit(failure) => {
                Some(failure)
            }
            _ => None,
        }
    }

    /// Whether callers that asked for cancellation should treat this as
    /// "not an error".
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ProcessError::Cancelled { .. })
    }

    /// Whether a cancellation outcome asked not to be shown to the user.
    pub fn is_silent(&self) -> bool {
        matches!(self, ProcessError::Cancelled { silent: true, .. })
    }

    pub(crate) fn launch(error: std::io::Error, program: &str) -> Self {
        if error.kind() == std::io::ErrorKind::NotFound {
            ProcessError::ToolNotFound(program.to_string())
        } else {
            ProcessError::LaunchFailed {
                program: program.to_string(),
                source: error,
            }
        }
    }
}
