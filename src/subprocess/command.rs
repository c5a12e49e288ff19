use super::error::ProcessError;

/// One logical invocation of the external tool.
///
/// `command` holds the subcommand words (`["resolve", "queries"]`), `args`
/// the remaining arguments. Logging or format flags are inserted between the
/// two by whichever runner executes the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub description: String,
    /// Skip the start/success log lines for chatty commands.
    pub silent: bool,
}

impl ToolCommand {
    /// Command words, then `flags`, then arguments.
    pub fn tokens(&self, flags: &[String]) -> Vec<String> {
        self.command
            .iter()
            .chain(flags)
            .chain(&self.args)
            .cloned()
            .collect()
    }

    /// Copy of this command with `extra` placed in front of the arguments.
    pub fn with_leading_args(&self, extra: &[String]) -> Self {
        let mut command = self.clone();
        command.args = extra.iter().chain(&self.args).cloned().collect();
        command
    }

    pub fn command_line(&self) -> String {
        self.command
            .iter()
            .chain(&self.args)
            .cloned()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

pub struct ToolCommandBuilder {
    command: ToolCommand,
}

impl ToolCommandBuilder {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let command: Vec<String> = words.into_iter().map(|s| s.as_ref().to_string()).collect();
        let description = command.join(" ");
        Self {
            command: ToolCommand {
                command,
                args: Vec::new(),
                description,
                silent: false,
            },
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.command.args.push(arg.to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.command
            .args
            .extend(args.into_iter().map(|s| s.as_ref().to_string()));
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.command.description = description.to_string();
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.command.silent = silent;
        self
    }

    pub fn build(self) -> ToolCommand {
        self.command
    }
}

/// Frame a worker request: a JSON array of the tokens followed by one NUL.
pub fn encode_request(tokens: &[String]) -> Result<Vec<u8>, ProcessError> {
    let mut request = serde_json::to_vec(tokens).map_err(|e| ProcessError::InternalError {
        message: format!("failed to encode request: {e}"),
    })?;
    request.push(0);
    Ok(request)
}
