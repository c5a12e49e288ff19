//! Exit statuses and the structured failures built from them

use std::fmt;

/// How a subprocess ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Error(i32),
    Signal(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Success => Some(0),
            ExitStatus::Error(code) => Some(*code),
            ExitStatus::Signal(_) => None,
        }
    }

    /// Convert a std exit status, falling back to the signal on Unix.
    pub fn from_std(status: std::process::ExitStatus) -> Self {
        if status.success() {
            ExitStatus::Success
        } else if let Some(code) = status.code() {
            ExitStatus::Error(code)
        } else {
            Self::from_signal(status)
        }
    }

    #[cfg(unix)]
    fn from_signal(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match status.signal() {
            Some(signal) => ExitStatus::Signal(signal),
            None => ExitStatus::Error(1),
        }
    }

    #[cfg(not(unix))]
    fn from_signal(_status: std::process::ExitStatus) -> Self {
        ExitStatus::Error(1)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Success => write!(f, "exited successfully"),
            ExitStatus::Error(code) => write!(f, "exited with code {code}"),
            ExitStatus::Signal(signal) => write!(f, "terminated by signal {signal}"),
        }
    }
}

/// Everything a caller needs to diagnose a failed command without
/// re-running it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredFailure {
    pub status: Option<ExitStatus>,
    pub stderr: String,
    pub command_line: Vec<String>,
    pub description: String,
    /// Text of the underlying error when the failure did not come from an
    /// exit status alone (a broken pipe, a closed stream).
    pub cause: Option<String>,
}

impl StructuredFailure {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|status| status.code())
    }

    pub fn command_line_string(&self) -> String {
        self.command_line.join(" ")
    }
}

impl fmt::Display for StructuredFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed with args:\n    {}\n",
            self.description,
            self.command_line_string()
        )?;

        let stderr = self.stderr.trim_end();
        if !stderr.is_empty() {
            write!(f, "{stderr}")?;
        } else if let Some(status) = &self.status {
            write!(f, "Process {status}")?;
        }

        if let Some(cause) = &self.cause {
            write!(f, "\n({cause})")?;
        }
        Ok(())
    }
}

/// Build the failure for a command from whatever is known about how it ended.
pub fn translate(
    status: Option<ExitStatus>,
    captured_stderr: &[u8],
    description: &str,
    command_line: &[String],
    cause: Option<String>,
) -> StructuredFailure {
    StructuredFailure {
        status,
        stderr: String::from_utf8_lossy(captured_stderr).into_owned(),
        command_line: command_line.to_vec(),
        description: description.to_string(),
        cause,
    }
}
