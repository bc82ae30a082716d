//! Tool handler seam.
//!
//! The registry only knows `(arguments) -> result`. In-process handlers are
//! plain closures; external tools run as child processes through
//! [`CommandHandler`].

use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::error::{HandlerError, HandlerErrorKind};
use crate::io::process::{command_from_argv, run_command_with_timeout};

/// Exit code a command handler uses to report `invalid_state`.
pub const EXIT_INVALID_STATE: i32 = 3;

pub trait ToolHandler {
    fn call(&self, args: &Map<String, Value>) -> Result<Value, HandlerError>;
}

impl<F> ToolHandler for F
where
    F: Fn(&Map<String, Value>) -> Result<Value, HandlerError>,
{
    fn call(&self, args: &Map<String, Value>) -> Result<Value, HandlerError> {
        self(args)
    }
}

/// Runs an external command: arguments as JSON on stdin, result as JSON on
/// stdout. Exit code 3 means `invalid_state`; any other failure is upstream.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    argv: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandHandler {
    pub fn new(argv: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            argv,
            timeout,
            output_limit_bytes,
        }
    }
}

impl ToolHandler for CommandHandler {
    #[instrument(skip_all, fields(program = self.argv.first().map(String::as_str).unwrap_or("")))]
    fn call(&self, args: &Map<String, Value>) -> Result<Value, HandlerError> {
        let cmd = command_from_argv(&self.argv)
            .map_err(|err| HandlerError::internal(format!("{err:#}")))?;
        let input = serde_json::to_vec(args)
            .map_err(|err| HandlerError::internal(format!("serialize arguments: {err}")))?;
        let output = run_command_with_timeout(cmd, Some(&input), self.timeout, self.output_limit_bytes)
            .map_err(|err| HandlerError::internal(format!("{err:#}")))?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "tool command timed out");
            return Err(HandlerError::new(
                HandlerErrorKind::Timeout,
                format!("tool command timed out after {}s", self.timeout.as_secs()),
            ));
        }
        if !output.status.success() {
            let stderr = output.stderr_text("tool");
            let kind = match output.status.code() {
                Some(EXIT_INVALID_STATE) => HandlerErrorKind::InvalidState,
                _ => HandlerErrorKind::Upstream,
            };
            let message = if stderr.is_empty() {
                format!("tool command exited with {:?}", output.status.code())
            } else {
                stderr
            };
            return Err(HandlerError::new(kind, message));
        }
        if output.stdout_truncated > 0 {
            return Err(HandlerError::upstream(format!(
                "tool output exceeded {} bytes",
                self.output_limit_bytes
            )));
        }

        debug!(bytes = output.stdout.len(), "tool command succeeded");
        serde_json::from_slice(&output.stdout)
            .map_err(|err| HandlerError::upstream(format!("tool output is not JSON: {err}")))
    }
}
