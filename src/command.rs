//! External command execution
//!
//! Every `ip`, `wg`, `wg-quick`, `iptables` and `sysctl` invocation goes
//! through [`CommandRunner`], which bounds it with a timeout. A timeout is
//! retried a limited number of times; any other failure is returned as is.

use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{PanelError, PanelResult};
use crate::validation;

#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
    retries: u32,
}

impl CommandRunner {
    pub fn new(timeout: Duration, retries: u32) -> Self {
        Self { timeout, retries }
    }

    /// Run a command and return its stdout. Non-zero exit is an error.
    pub async fn run(&self, program: &str, args: &[&str]) -> PanelResult<String> {
        let cmd_str = render(program, args);
        let output = self.output(program, args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = if stderr.trim().is_empty() {
                String::from_utf8_lossy(&output.stdout).to_string()
            } else {
                stderr.to_string()
            };
            return Err(PanelError::CommandFailed {
                cmd: cmd_str,
                code: output.status.code(),
                stderr: validation::sanitize_error_message(&stderr),
            });
        }

        String::from_utf8(output.stdout)
            .map_err(|e| PanelError::ParseError(format!("Invalid UTF-8 from '{}': {}", cmd_str, e)))
    }

    /// Run a command and report whether it exited successfully.
    ///
    /// Spawn failures and timeouts are still errors.
    pub async fn succeeds(&self, program: &str, args: &[&str]) -> PanelResult<bool> {
        let output = self.output(program, args).await?;
        Ok(output.status.success())
    }

    async fn output(&self, program: &str, args: &[&str]) -> PanelResult<Output> {
        let cmd_str = render(program, args);
        let mut attempt = 0;

        loop {
            debug!("exec: {}", cmd_str);
            let mut command = Command::new(program);
            command.args(args).kill_on_drop(true);

            match tokio::time::timeout(self.timeout, command.output()).await {
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(e)) => {
                    return Err(PanelError::CommandFailed {
                        cmd: cmd_str,
                        code: None,
                        stderr: e.to_string(),
                    });
                }
                Err(_) if attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        "'{}' timed out after {:?}, retrying ({}/{})",
                        cmd_str, self.timeout, attempt, self.retries
                    );
                }
                Err(_) => {
                    return Err(PanelError::Timeout(format!(
                        "'{}' did not finish within {:?}",
                        cmd_str, self.timeout
                    )));
                }
            }
        }
    }
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), 1)
    }
}

fn render(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let runner = CommandRunner::default();
        let out = runner.run("echo", &["hello"]).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_command_failed() {
        let runner = CommandRunner::default();
        match runner.run("sh", &["-c", "echo boom >&2; exit 3"]).await {
            Err(PanelError::CommandFailed { code, stderr, .. }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!runner.succeeds("false", &[]).await.unwrap());
        assert!(runner.succeeds("true", &[]).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let runner = CommandRunner::default();
        let err = runner.run("definitely-not-a-real-binary-wgpanel", &[]).await.unwrap_err();
        assert!(matches!(err, PanelError::CommandFailed { code: None, .. }));
    }

    #[tokio::test]
    async fn test_timeout_after_retries() {
        let runner = CommandRunner::new(Duration::from_millis(50), 1);
        let err = runner.run("sleep", &["5"]).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
