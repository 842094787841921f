//! Command execution seam.
//!
//! Everything that shells out (chart tool, container builder, git, secret
//! provider CLI) goes through an [`Executor`], so the pipeline can be driven
//! against a recording fake in tests.

pub mod local;

pub use local::ProcessExecutor;

use crate::runner::CancelToken;
use std::path::Path;
use thiserror::Error;

/// Output from running one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    /// Interleaved stdout and stderr
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Failure to run a command to completion.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("empty command line")]
    EmptyCommand,

    #[error("failed to spawn {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} was cancelled")]
    Cancelled { program: String, output: String },

    #[error("{program} exited with code {code}: {}", output.trim())]
    Failed {
        program: String,
        code: i32,
        output: String,
    },
}

impl ExecError {
    /// Output captured before the failure, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Cancelled { output, .. } | Self::Failed { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Runs an argument vector in a working directory.
pub trait Executor: Send + Sync {
    fn execute(
        &self,
        args: &[String],
        cwd: &Path,
        cancel: &CancelToken,
    ) -> Result<ExecOutput, ExecError>;
}

/// Run a command and treat a non-zero exit as an error.
pub fn run_checked(
    executor: &dyn Executor,
    args: &[String],
    cwd: &Path,
    cancel: &CancelToken,
) -> Result<String, ExecError> {
    let out = executor.execute(args, cwd, cancel)?;
    if out.success() {
        Ok(out.output)
    } else {
        Err(ExecError::Failed {
            program: args.first().cloned().unwrap_or_default(),
            code: out.exit_code,
            output: out.output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(ExecOutput);

    impl Executor for Fixed {
        fn execute(&self, _: &[String], _: &Path, _: &CancelToken) -> Result<ExecOutput, ExecError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_exec_output_success() {
        let ok = ExecOutput { exit_code: 0, output: "ok".into() };
        assert!(ok.success());
        let fail = ExecOutput { exit_code: 1, output: "err".into() };
        assert!(!fail.success());
        let sig = ExecOutput { exit_code: -1, output: "killed".into() };
        assert!(!sig.success());
    }

    #[test]
    fn test_run_checked_maps_exit_code() {
        let args = vec!["helm".to_string(), "status".to_string()];
        let exec = Fixed(ExecOutput { exit_code: 2, output: "Error: boom\n".into() });
        let err = run_checked(&exec, &args, Path::new("."), &CancelToken::new()).unwrap_err();
        assert_eq!(err.to_string(), "helm exited with code 2: Error: boom");
        assert_eq!(err.output(), Some("Error: boom\n"));

        let exec = Fixed(ExecOutput { exit_code: 0, output: "fine".into() });
        let out = run_checked(&exec, &args, Path::new("."), &CancelToken::new()).unwrap();
        assert_eq!(out, "fine");
    }
}
