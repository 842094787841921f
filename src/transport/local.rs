//! Local process execution.

use super::{ExecError, ExecOutput, Executor};
use crate::runner::CancelToken;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Runs commands as child processes of this one.
///
/// Stdout and stderr are collected into one buffer in arrival order. The
/// child is killed if the token trips while it is running.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor;

impl Executor for ProcessExecutor {
    fn execute(
        &self,
        args: &[String],
        cwd: &Path,
        cancel: &CancelToken,
    ) -> Result<ExecOutput, ExecError> {
        let (program, rest) = args.split_first().ok_or(ExecError::EmptyCommand)?;
        debug!(command = %args.join(" "), cwd = %cwd.display(), "executing");

        let mut child = Command::new(program)
            .args(rest)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExecError::Spawn {
                program: program.clone(),
                source,
            })?;

        let combined = Arc::new(Mutex::new(Vec::new()));
        let readers = [
            child.stdout.take().map(|s| collect(s, Arc::clone(&combined))),
            child.stderr.take().map(|s| collect(s, Arc::clone(&combined))),
        ];

        let status = wait(&mut child, cancel, program);
        for reader in readers.into_iter().flatten() {
            let _ = reader.join();
        }
        let bytes = Arc::try_unwrap(combined)
            .map(|m| m.into_inner().unwrap_or_else(PoisonError::into_inner))
            .unwrap_or_else(|shared| shared.lock().unwrap_or_else(PoisonError::into_inner).clone());
        let output = String::from_utf8_lossy(&bytes).into_owned();

        match status? {
            Some(exit_code) => Ok(ExecOutput { exit_code, output }),
            None => Err(ExecError::Cancelled {
                program: program.clone(),
                output,
            }),
        }
    }
}

/// Poll until the child exits or the token trips. `None` means cancelled.
fn wait(child: &mut Child, cancel: &CancelToken, program: &str) -> Result<Option<i32>, ExecError> {
    let wait_err = |source| ExecError::Wait {
        program: program.to_string(),
        source,
    };
    loop {
        if let Some(status) = child.try_wait().map_err(wait_err)? {
            // killed by a signal: no exit code
            return Ok(Some(status.code().unwrap_or(-1)));
        }
        if cancel.is_cancelled() {
            debug!(program, "cancelled, killing child");
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn collect<R: Read + Send + 'static>(
    mut stream: R,
    sink: Arc<Mutex<Vec<u8>>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        while let Ok(n) = stream.read(&mut buf) {
            if n == 0 {
                break;
            }
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(&buf[..n]);
        }
    })
}
