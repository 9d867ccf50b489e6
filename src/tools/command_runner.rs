//! Whitelisted subprocess execution. The input command string is tokenized
//! without any shell interpretation: the first token is the executable, the
//! rest are literal argv elements.

use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::CommandRunnerConfig;
use crate::task::{ExecutionInput, ExecutionResult};
use crate::tool::Tool;

const MAX_COMMAND_CHARS: usize = 8192;
const MAX_TOKENS: usize = 100;
const MAX_TOKEN_CHARS: usize = 2048;

/// Always enforced, regardless of the configured whitelist.
const BLOCKED_COMMANDS: &[&str] = &[
    "rm", "del", "format", "fdisk", "mkfs", "dd", "shutdown", "reboot", "halt", "poweroff", "su",
    "sudo", "runas", "net", "sc", "service", "kill", "killall", "taskkill", "wmic",
];

pub struct CommandRunnerTool {
    timeout: Duration,
    allowed_commands: HashSet<String>,
}

impl CommandRunnerTool {
    pub fn new(config: &CommandRunnerConfig) -> Self {
        Self {
            timeout: config.timeout,
            allowed_commands: config.allowed_commands.clone(),
        }
    }

    fn validate(&self, command: &str) -> Result<Vec<String>, String> {
        if command.chars().count() > MAX_COMMAND_CHARS {
            return Err(format!("Command exceeds {MAX_COMMAND_CHARS} characters"));
        }
        let tokens = tokenize(command)?;
        if tokens.is_empty() {
            return Err("Command must not be empty".to_owned());
        }
        if tokens.len() > MAX_TOKENS {
            return Err(format!("Command exceeds {MAX_TOKENS} tokens"));
        }
        for token in &tokens {
            if token.chars().count() > MAX_TOKEN_CHARS {
                return Err(format!("Token exceeds {MAX_TOKEN_CHARS} characters"));
            }
            if token.chars().any(|c| matches!(c, '\0' | '\n' | '\r')) {
                return Err("Command tokens must not contain null bytes or line breaks".to_owned());
            }
        }

        let executable = &tokens[0];
        if executable.contains("..") {
            return Err("Executable must not contain '..'".to_owned());
        }
        if !self.allowed_commands.is_empty() && !self.allowed_commands.contains(executable) {
            return Err(format!("Dangerous command blocked: {executable}"));
        }
        let base = Path::new(executable)
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let base = base.strip_suffix(".exe").unwrap_or(&base);
        if BLOCKED_COMMANDS.contains(&base) {
            return Err(format!("Dangerous command blocked: {executable}"));
        }

        Ok(tokens)
    }

    async fn spawn(&self, command: &str, tokens: Vec<String>) -> ExecutionResult {
        // One pipe serves both streams: its write end is duplicated into
        // the stdout and stderr slots, so the combined output preserves
        // the child's write order across the two streams.
        let (reader, stderr_writer) = match os_pipe::pipe() {
            Ok(pair) => pair,
            Err(e) => {
                return ExecutionResult::failure(format!("Failed to set up output capture: {e}"));
            },
        };
        let stdout_writer = match stderr_writer.try_clone() {
            Ok(writer) => writer,
            Err(e) => {
                return ExecutionResult::failure(format!("Failed to set up output capture: {e}"));
            },
        };

        let mut cmd = Command::new(&tokens[0]);
        cmd.args(&tokens[1..])
            .stdin(Stdio::null())
            .stdout(stdout_writer)
            .stderr(stderr_writer)
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return ExecutionResult::failure(format!("Failed to start command: {e}")),
        };
        // The command still holds the parent's copies of the write ends;
        // close them so the reader sees EOF once the child exits.
        drop(cmd);

        // Drain concurrently with the wait: a child that fills the pipe
        // buffer would block forever against a parent that only reads
        // after exit.
        let drain = tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut combined = Vec::new();
            std::io::Read::read_to_end(&mut reader, &mut combined).map(|_| combined)
        });

        match timeout(self.timeout, child.wait()).await {
            Err(_) => {
                tracing::warn!(command, "command timed out");
                let _ = child.start_kill();
                ExecutionResult::failure(format!(
                    "Command timed out after {}s",
                    self.timeout.as_secs()
                ))
            },
            Ok(Err(e)) => ExecutionResult::failure(format!("Failed to run command: {e}")),
            Ok(Ok(status)) => {
                let exit_code = status.code().unwrap_or(-1);
                let combined = match drain.await {
                    Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                    Ok(Err(e)) => {
                        return ExecutionResult::failure(format!(
                            "Failed to read command output: {e}"
                        ));
                    },
                    Err(e) => {
                        return ExecutionResult::failure(format!(
                            "Failed to read command output: {e}"
                        ));
                    },
                };

                ExecutionResult {
                    success: exit_code == 0,
                    output: format!("ExitCode={exit_code}\n{combined}"),
                    metadata: serde_json::json!({
                        "exit_code": exit_code,
                        "command": command,
                    }),
                }
            },
        }
    }
}

/// Recognizes three token forms: double-quoted, single-quoted and bare
/// whitespace-delimited. Quotes concatenate with adjacent text, shell-style;
/// nothing else of the shell is emulated.
fn tokenize(command: &str) -> Result<Vec<String>, String> {
    #[derive(PartialEq)]
    enum Mode {
        Bare,
        Double,
        Single,
    }

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut started = false;
    let mut mode = Mode::Bare;

    for c in command.chars() {
        match mode {
            Mode::Double => {
                if c == '"' {
                    mode = Mode::Bare;
                } else {
                    current.push(c);
                }
            },
            Mode::Single => {
                if c == '\'' {
                    mode = Mode::Bare;
                } else {
                    current.push(c);
                }
            },
            Mode::Bare => match c {
                '"' => {
                    mode = Mode::Double;
                    started = true;
                },
                '\'' => {
                    mode = Mode::Single;
                    started = true;
                },
                c if c.is_whitespace() => {
                    if started {
                        tokens.push(std::mem::take(&mut current));
                        started = false;
                    }
                },
                c => {
                    current.push(c);
                    started = true;
                },
            },
        }
    }

    if mode != Mode::Bare {
        return Err("Unterminated quoted token".to_owned());
    }
    if started {
        tokens.push(current);
    }
    Ok(tokens)
}

impl Tool for CommandRunnerTool {
    fn name(&self) -> &str {
        "command_runner"
    }

    fn description(&self) -> &str {
        "Runs a single whitelisted command without a shell. Quote arguments \
         containing spaces; output is the exit code followed by combined \
         stdout and stderr."
    }

    fn run(&self, input: ExecutionInput) -> BoxFuture<'_, ExecutionResult> {
        Box::pin(async move {
            let command = input.content.trim().to_owned();
            match self.validate(&command) {
                Ok(tokens) => self.spawn(&command, tokens).await,
                Err(message) => ExecutionResult::failure(message),
            }
        })
    }
}
