use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{captured_stdio, with_timeout, ChildProcess, Protocol, RawResult, Transport, TransportError};
use crate::interpreter::InterpreterCommand;
use crate::session::Snapshot;

/// Environment variable rustup reads to pick the toolchain of cargo/rustc
/// invocations made by the interpreter.
pub const TOOLCHAIN_ENV: &str = "RUSTUP_TOOLCHAIN";

/// First-generation transport: one interpreter process per evaluation.
///
/// The process is invoked as `<program> <args...> <dependencies> <code>` and
/// its stdout, whatever the exit status, is the result. All session state
/// lives on the kernel side. An evaluation that exceeds the timeout is killed
/// and reported as the cell's output.
pub struct OneShotBridge {
    command: InterpreterCommand,
    timeout: Option<Duration>,
}

impl OneShotBridge {
    pub fn new(command: InterpreterCommand, timeout: Option<Duration>) -> Self {
        Self { command, timeout }
    }

    async fn run(&self, snapshot: &Snapshot) -> Result<String, TransportError> {
        let mut command = self.command.to_command();
        command
            .arg(&snapshot.dependencies)
            .arg(&snapshot.code)
            .env(TOOLCHAIN_ENV, snapshot.toolchain.to_string());
        captured_stdio(&mut command);

        let program = self.command.display_name();
        let mut process = ChildProcess::spawn(command, &program)?;

        let child = process.child_mut();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let outcome = with_timeout(self.timeout, async {
            let (stdout, stderr, status) =
                tokio::try_join!(read_pipe(stdout), read_pipe(stderr), child.wait())?;
            Ok((stdout, stderr, status))
        })
        .await;

        let (stdout, stderr, status) = match outcome {
            Ok(captured) => captured,
            Err(e) => {
                warn!("[bridge] One-shot interpreter failed: {}", e);
                process.kill().await;
                return Err(e);
            }
        };

        if !status.success() {
            info!("[bridge] Interpreter exited with {}", status);
        }
        if !stderr.is_empty() {
            debug!(
                "[bridge] Interpreter stderr: {}",
                String::from_utf8_lossy(&stderr).trim_end()
            );
        }

        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }
}

async fn read_pipe(pipe: Option<impl AsyncRead + Unpin>) -> std::io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buffer).await?;
    }
    Ok(buffer)
}

impl Transport for OneShotBridge {
    async fn evaluate(&mut self, snapshot: &Snapshot) -> Result<RawResult, TransportError> {
        debug!(
            "[bridge] One-shot evaluation: {} bytes of code, deps {:?}, toolchain {}",
            snapshot.code.len(),
            snapshot.dependencies,
            snapshot.toolchain
        );
        match self.run(snapshot).await {
            Ok(stdout) => Ok(RawResult::Text(stdout)),
            // The child is already killed and held no session state, so a
            // timeout only costs this cell.
            Err(e @ TransportError::Timeout(_)) => Ok(RawResult::Text(format!("{}\n", e))),
            Err(e) => Err(e),
        }
    }

    /// Directives are folded into later invocations: dependencies through
    /// the dependency argument, the toolchain through [`TOOLCHAIN_ENV`].
    async fn forward_directive(&mut self, _cell: &str) -> Result<Option<RawResult>, TransportError> {
        Ok(None)
    }

    /// The abandoned child was killed on drop and held no state.
    async fn cancel(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn terminate(&mut self) {}

    fn protocol(&self) -> Protocol {
        Protocol::OneShot
    }
}
