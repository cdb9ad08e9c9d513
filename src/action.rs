//! Actions held in reserve by the switch and run, in order, when it triggers.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::watch;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors produced while building or running an action.
#[derive(Debug)]
pub enum ActionError {
    /// An exec action was blank or had a blank program.
    EmptyCommand,
    /// The subprocess could not be spawned.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// The subprocess ran but did not exit successfully (None if killed by signal).
    ExitStatus { command: String, code: Option<i32> },
    /// Nothing is listening for the shutdown request anymore.
    Shutdown,
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionError::EmptyCommand => write!(f, "a non-empty command is required"),
            ActionError::Spawn { command, source } => {
                write!(f, "failed to spawn `{}`: {}", command, source)
            }
            ActionError::ExitStatus {
                command,
                code: Some(code),
            } => write!(f, "`{}` exited with status {}", command, code),
            ActionError::ExitStatus { command, code: None } => {
                write!(f, "`{}` was terminated by a signal", command)
            }
            ActionError::Shutdown => write!(f, "shutdown requested but no one is listening"),
        }
    }
}

impl std::error::Error for ActionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ActionError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// A unit of work the switch fires when it is not postponed in time.
pub trait Action: Send + Sync {
    /// Human-readable description, used only for logging.
    fn describe(&self) -> String;

    /// Run the action. Failures are logged by the caller and never retried.
    fn execute(&self) -> BoxFuture<'_, Result<(), ActionError>>;
}

/// Run each action in sequence. A failing or panicking action does not stop
/// the ones after it. Returns the number of actions that failed.
pub async fn trigger(actions: &Arc<[Box<dyn Action>]>) -> usize {
    let mut failures = 0;
    for (index, action) in actions.iter().enumerate() {
        let description = action.describe();
        tracing::info!(action = %description, "running action");

        // Own task per action so a panic surfaces as a JoinError here.
        let actions = Arc::clone(actions);
        let task = tokio::spawn(async move { actions[index].execute().await });

        let error = match task.await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };
        failures += 1;
        tracing::error!(action = %description, error = %error, "action error");
    }
    failures
}

/// Runs a subprocess with inherited stdout/stderr.
#[derive(Debug, Clone)]
pub struct ExecAction {
    command_line: String,
    program: String,
    args: Vec<String>,
    dir: Option<PathBuf>,
}

impl ExecAction {
    /// Parse a command line into a program and its arguments.
    ///
    /// Pieces are separated by single spaces and no quoting is honored, so
    /// `echo 'hi there'` passes `'hi` and `there'` as two arguments.
    pub fn parse(command_line: &str, dir: Option<&Path>) -> Result<Self, ActionError> {
        let mut pieces = command_line.split(' ');
        let program = match pieces.next() {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => return Err(ActionError::EmptyCommand),
        };

        Ok(Self {
            command_line: command_line.to_string(),
            program,
            args: pieces.map(str::to_string).collect(),
            dir: dir.map(Path::to_path_buf),
        })
    }

    #[cfg(test)]
    pub fn program(&self) -> &str {
        &self.program
    }

    #[cfg(test)]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[cfg(test)]
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }
}

impl Action for ExecAction {
    fn describe(&self) -> String {
        self.command_line.clone()
    }

    fn execute(&self) -> BoxFuture<'_, Result<(), ActionError>> {
        Box::pin(async move {
            let mut cmd = Command::new(&self.program);
            cmd.args(&self.args);
            if let Some(dir) = &self.dir {
                cmd.current_dir(dir);
            }

            let status = cmd.status().await.map_err(|e| ActionError::Spawn {
                command: self.command_line.clone(),
                source: e,
            })?;

            tracing::debug!(
                command = %self.command_line,
                exit_code = ?status.code(),
                "action subprocess exited"
            );

            if status.success() {
                Ok(())
            } else {
                Err(ActionError::ExitStatus {
                    command: self.command_line.clone(),
                    code: status.code(),
                })
            }
        })
    }
}

/// Parse every configured command. Any empty command rejects the whole list.
pub fn parse_exec(commands: &[String], dir: Option<&Path>) -> Result<Vec<ExecAction>, ActionError> {
    commands
        .iter()
        .map(|c| ExecAction::parse(c, dir))
        .collect()
}

/// Asks the owning process to shut down. Appended after the configured
/// actions so the process exits once the switch has fired.
#[derive(Debug)]
pub struct ShutdownAction {
    tx: watch::Sender<bool>,
}

impl ShutdownAction {
    pub fn new(tx: watch::Sender<bool>) -> Self {
        Self { tx }
    }
}

impl Action for ShutdownAction {
    fn describe(&self) -> String {
        "shutdown".to_string()
    }

    fn execute(&self) -> BoxFuture<'_, Result<(), ActionError>> {
        Box::pin(async move { self.tx.send(true).map_err(|_| ActionError::Shutdown) })
    }
}
