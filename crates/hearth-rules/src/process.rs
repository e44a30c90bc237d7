//! The external-process subsystem.
//!
//! Subprocesses run in background tasks; their exit reports re-enter the
//! engine loop the same way timer ticks do, so process callbacks execute on
//! the engine thread under the same serialization discipline as rule bodies.

use std::process::Stdio;

use hearth_core::{Error, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{error, warn};

use crate::bridge::ScriptCtx;
use crate::callbacks::CallbackId;
use crate::engine::EngineInner;
use crate::script::{Callable, CallbackArgs, ProcessExit};

/// How to run a subprocess.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Buffer stdout and pass it to the exit callback.
    pub capture_output: bool,
    /// Buffer stderr and pass it to the exit callback.
    pub capture_error_output: bool,
    /// Payload written to the child's stdin.
    pub input: Option<String>,
}

impl EngineInner {
    /// Launch `argv` in the background. If a callback is given it is stored
    /// under a process handle and invoked once, on the engine thread, with
    /// the exit report; without a callback a nonzero exit is logged.
    pub(crate) fn spawn_process(
        &mut self,
        argv: Vec<String>,
        callback: Option<Callable>,
        options: SpawnOptions,
    ) -> Result<()> {
        if argv.is_empty() {
            return Err(Error::Process("spawn requires a non-empty argv".into()));
        }
        let callback_id = callback.map(|f| self.process_callbacks.store(f));
        let handle = self.handle.clone();
        let command = argv[0].clone();
        tokio::spawn(async move {
            match run_child(&argv, &options).await {
                Err(err) => {
                    error!(command = %command, error = %err, "external command failed");
                    if let Some(id) = callback_id {
                        handle.inject(move |engine| engine.process_callbacks.remove(id));
                    }
                }
                Ok(exit) => {
                    if let Some(id) = callback_id {
                        handle.inject(move |engine| engine.finish_process(id, exit));
                    } else if exit.exit_status != 0 {
                        error!(
                            command = %command,
                            status = exit.exit_status,
                            "command failed"
                        );
                    }
                }
            }
        });
        Ok(())
    }

    pub(crate) fn run_shell_command(
        &mut self,
        cmd: &str,
        callback: Option<Callable>,
        options: SpawnOptions,
    ) -> Result<()> {
        self.spawn_process(
            vec!["/bin/sh".to_string(), "-c".to_string(), cmd.to_string()],
            callback,
            options,
        )
    }

    /// Runs on the engine thread once the child has exited: invoke the
    /// callback and release its handle.
    pub(crate) fn finish_process(&mut self, id: CallbackId, exit: ProcessExit) {
        let Some(callback) = self.process_callbacks.get(id) else {
            warn!(callback = %id, "process callback vanished");
            return;
        };
        let result = callback(&mut ScriptCtx::new(self), &CallbackArgs::ProcessExit(exit));
        self.process_callbacks.remove(id);
        if let Err(err) = result {
            error!(error = %err, "process callback failed");
        }
    }
}

async fn run_child(argv: &[String], options: &SpawnOptions) -> std::io::Result<ProcessExit> {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .stdin(if options.input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(if options.capture_output {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stderr(if options.capture_error_output {
            Stdio::piped()
        } else {
            Stdio::null()
        });

    let mut child = cmd.spawn()?;
    if let Some(input) = &options.input {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await?;
            // Dropping stdin closes the pipe so the child sees EOF.
        }
    }
    let output = child.wait_with_output().await?;

    Ok(ProcessExit {
        exit_status: output.status.code().unwrap_or(-1),
        captured_output: options
            .capture_output
            .then(|| String::from_utf8_lossy(&output.stdout).into_owned()),
        captured_error_output: options
            .capture_error_output
            .then(|| String::from_utf8_lossy(&output.stderr).into_owned()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_streams_and_exit_status() {
        let argv: Vec<String> = ["/bin/sh", "-c", "echo out; echo err 1>&2; exit 3"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let exit = run_child(
            &argv,
            &SpawnOptions {
                capture_output: true,
                capture_error_output: true,
                input: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(exit.exit_status, 3);
        assert_eq!(exit.captured_output.as_deref(), Some("out\n"));
        assert_eq!(exit.captured_error_output.as_deref(), Some("err\n"));
    }

    #[tokio::test]
    async fn stdin_payload_reaches_the_child() {
        let argv: Vec<String> = ["/bin/sh", "-c", "cat"].iter().map(|s| s.to_string()).collect();
        let exit = run_child(
            &argv,
            &SpawnOptions {
                capture_output: true,
                capture_error_output: false,
                input: Some("payload\n".to_string()),
            },
        )
        .await
        .unwrap();

        assert_eq!(exit.exit_status, 0);
        assert_eq!(exit.captured_output.as_deref(), Some("payload\n"));
        assert_eq!(exit.captured_error_output, None);
    }

    #[tokio::test]
    async fn uncaptured_streams_stay_none() {
        let argv: Vec<String> = ["/bin/true"].iter().map(|s| s.to_string()).collect();
        let exit = run_child(&argv, &SpawnOptions::default()).await.unwrap();
        assert_eq!(exit.exit_status, 0);
        assert!(exit.captured_output.is_none());
        assert!(exit.captured_error_output.is_none());
    }
}
