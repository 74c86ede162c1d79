//! Process bridge to the `re` interpreter.
//!
//! Two protocol generations exist and both implement [`Transport`]:
//!
//! - [`OneShotBridge`]: spawn `re <deps> <code>` per evaluation, capture stdout
//! - [`JsonLineBridge`]: one persistent `re` process speaking NDJSON
//!
//! [`Bridge`] picks one at construction time so the dispatcher only ever
//! sees the trait.

use std::fmt;
use std::future::Future;
use std::io;
use std::process::Stdio;
use std::time::Duration;

use irust_protocol::Response;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};

use crate::interpreter::InterpreterCommand;
use crate::session::Snapshot;
use crate::settings::KernelSettings;

mod json_line;
mod oneshot;

pub use json_line::JsonLineBridge;
pub use oneshot::OneShotBridge;

/// Which protocol generation to speak with the interpreter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum Protocol {
    /// One process per evaluation, arguments in, stdout out.
    #[default]
    #[serde(rename = "oneshot")]
    #[value(name = "oneshot")]
    OneShot,
    /// Persistent process, newline-delimited JSON requests and responses.
    #[serde(rename = "json-line")]
    #[value(name = "json-line")]
    JsonLine,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::OneShot => write!(f, "oneshot"),
            Protocol::JsonLine => write!(f, "json-line"),
        }
    }
}

/// Unprocessed result of one interpreter round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawResult {
    /// Captured stdout of a one-shot invocation.
    Text(String),
    /// Parsed response line of the persistent interpreter.
    Response(Response),
}

/// Failures of the bridge itself. Interpreter-reported compile or runtime
/// errors are not transport errors; they arrive as ordinary output.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to spawn interpreter `{program}`: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("interpreter pipe error: {0}")]
    Io(#[from] io::Error),

    #[error("interpreter exited unexpectedly")]
    ChildExited,

    #[error("malformed response from interpreter {line:?}: {source}")]
    Malformed {
        line: String,
        source: serde_json::Error,
    },

    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("interpreter did not respond within {0:?}")]
    Timeout(Duration),

    #[error("a previous request is still waiting for its response")]
    Desynchronized,

    #[error("interpreter round trip was interrupted")]
    Interrupted,

    #[error("interpreter has been terminated")]
    Terminated,
}

/// Capability to run code in the interpreter.
///
/// Every method performs at most one round trip with the interpreter.
pub trait Transport {
    /// Evaluate `snapshot.code` with the snapshot's dependencies and toolchain.
    fn evaluate(
        &mut self,
        snapshot: &Snapshot,
    ) -> impl Future<Output = Result<RawResult, TransportError>> + Send;

    /// Hand a directive cell (`:add`, `:toolchain`) to the interpreter.
    /// Returns `None` when the transport interprets directives locally.
    fn forward_directive(
        &mut self,
        cell: &str,
    ) -> impl Future<Output = Result<Option<RawResult>, TransportError>> + Send;

    /// Called after an in-flight round trip was abandoned. An error means the
    /// transport cannot be used any more.
    fn cancel(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Stop the interpreter for good.
    fn terminate(&mut self) -> impl Future<Output = ()> + Send;

    fn protocol(&self) -> Protocol;
}

/// The transport selected by configuration.
pub enum Bridge {
    OneShot(OneShotBridge),
    JsonLine(JsonLineBridge),
}

impl Bridge {
    /// Build the transport for `protocol`. The persistent interpreter is
    /// spawned immediately; one-shot spawns lazily per evaluation.
    pub fn connect(
        protocol: Protocol,
        command: InterpreterCommand,
        timeout: Option<Duration>,
    ) -> Result<Self, TransportError> {
        match protocol {
            Protocol::OneShot => Ok(Bridge::OneShot(OneShotBridge::new(command, timeout))),
            Protocol::JsonLine => Ok(Bridge::JsonLine(JsonLineBridge::spawn(&command, timeout)?)),
        }
    }

    pub fn from_settings(settings: &KernelSettings) -> Result<Self, TransportError> {
        Self::connect(
            settings.protocol,
            settings.interpreter_command(),
            settings.eval_timeout(),
        )
    }
}

impl Transport for Bridge {
    async fn evaluate(&mut self, snapshot: &Snapshot) -> Result<RawResult, TransportError> {
        match self {
            Bridge::OneShot(bridge) => bridge.evaluate(snapshot).await,
            Bridge::JsonLine(bridge) => bridge.evaluate(snapshot).await,
        }
    }

    async fn forward_directive(&mut self, cell: &str) -> Result<Option<RawResult>, TransportError> {
        match self {
            Bridge::OneShot(bridge) => bridge.forward_directive(cell).await,
            Bridge::JsonLine(bridge) => bridge.forward_directive(cell).await,
        }
    }

    async fn cancel(&mut self) -> Result<(), TransportError> {
        match self {
            Bridge::OneShot(bridge) => bridge.cancel().await,
            Bridge::JsonLine(bridge) => bridge.cancel().await,
        }
    }

    async fn terminate(&mut self) {
        match self {
            Bridge::OneShot(bridge) => bridge.terminate().await,
            Bridge::JsonLine(bridge) => bridge.terminate().await,
        }
    }

    fn protocol(&self) -> Protocol {
        match self {
            Bridge::OneShot(bridge) => bridge.protocol(),
            Bridge::JsonLine(bridge) => bridge.protocol(),
        }
    }
}

/// An interpreter process owned by a bridge.
///
/// On Unix the child leads its own process group so that cargo and rustc
/// descendants die with it. The group is killed on [`ChildProcess::kill`]
/// and on drop.
pub(crate) struct ChildProcess {
    child: Child,
    #[cfg(unix)]
    process_group_id: Option<i32>,
}

impl ChildProcess {
    pub(crate) fn spawn(mut command: Command, program: &str) -> Result<Self, TransportError> {
        #[cfg(unix)]
        command.process_group(0);

        let child = command
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransportError::Spawn {
                program: program.to_string(),
                source,
            })?;

        debug!("[bridge] Spawned {} (pid {:?})", program, child.id());

        Ok(Self {
            #[cfg(unix)]
            process_group_id: child.id().map(|pid| pid as i32),
            child,
        })
    }

    pub(crate) fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    /// Kill the interpreter and everything it started.
    pub(crate) async fn kill(&mut self) {
        self.kill_group();
        if let Err(e) = self.child.kill().await {
            if e.kind() != io::ErrorKind::InvalidInput {
                error!("[bridge] Failed to kill interpreter: {}", e);
            }
        }
    }

    fn kill_group(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.process_group_id.take() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                if e != nix::errno::Errno::ESRCH {
                    error!("[bridge] Failed to kill process group {}: {}", pgid, e);
                }
            }
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        self.kill_group();
    }
}

/// Stdio for a one-shot child: nothing in, everything captured.
pub(crate) fn captured_stdio(command: &mut Command) {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
}

/// Run `future` under the optional evaluation timeout.
pub(crate) async fn with_timeout<T>(
    timeout: Option<Duration>,
    future: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| TransportError::Timeout(limit))?,
        None => future.await,
    }
}
