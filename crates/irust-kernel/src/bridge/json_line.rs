use std::process::Stdio;
use std::time::Duration;

use irust_protocol::{Request, Response};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};

use super::{with_timeout, ChildProcess, Protocol, RawResult, Transport, TransportError};
use crate::interpreter::InterpreterCommand;
use crate::session::Snapshot;

struct Pipes {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Second-generation transport: one persistent interpreter speaking NDJSON.
///
/// Strictly one request line in, one response line out. A request is never
/// written while the response to the previous one is outstanding; if a round
/// trip is abandoned halfway the bridge is desynchronized for good.
pub struct JsonLineBridge {
    process: Option<ChildProcess>,
    pipes: Option<Pipes>,
    timeout: Option<Duration>,
    in_flight: bool,
    round_trips: u64,
}

impl JsonLineBridge {
    /// Spawn the interpreter. It stays alive until [`Transport::terminate`]
    /// or drop.
    pub fn spawn(
        command: &InterpreterCommand,
        timeout: Option<Duration>,
    ) -> Result<Self, TransportError> {
        let mut cmd = command.to_command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let program = command.display_name();
        let mut process = ChildProcess::spawn(cmd, &program)?;

        let child = process.child_mut();
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => return Err(TransportError::ChildExited),
        };

        info!("[bridge] Persistent interpreter {} started", program);

        Ok(Self {
            process: Some(process),
            pipes: Some(Pipes {
                stdin,
                stdout: BufReader::new(stdout),
            }),
            timeout,
            in_flight: false,
            round_trips: 0,
        })
    }

    /// Whether a request was written whose response was never read.
    pub fn is_desynchronized(&self) -> bool {
        self.in_flight
    }

    /// Number of completed request/response exchanges.
    pub fn round_trips(&self) -> u64 {
        self.round_trips
    }

    /// Write one request line, flush, and read exactly one response line.
    pub async fn round_trip(&mut self, request: &Request) -> Result<Response, TransportError> {
        if self.in_flight {
            return Err(TransportError::Desynchronized);
        }
        let pipes = self.pipes.as_mut().ok_or(TransportError::Terminated)?;
        let line = request.to_line().map_err(TransportError::Encode)?;

        self.in_flight = true;
        let timeout = self.timeout;
        let response_line = with_timeout(timeout, async {
            pipes.stdin.write_all(line.as_bytes()).await?;
            pipes.stdin.flush().await?;

            let mut response_line = String::new();
            if pipes.stdout.read_line(&mut response_line).await? == 0 {
                return Err(TransportError::ChildExited);
            }
            Ok(response_line)
        })
        .await?;
        self.in_flight = false;
        self.round_trips += 1;

        debug!("[bridge] <- {}", response_line.trim_end());

        Response::from_line(&response_line).map_err(|source| TransportError::Malformed {
            line: response_line.trim_end().to_string(),
            source,
        })
    }
}

impl Transport for JsonLineBridge {
    async fn evaluate(&mut self, snapshot: &Snapshot) -> Result<RawResult, TransportError> {
        let response = self.round_trip(&Request::execute(snapshot.code.as_str())).await?;
        Ok(RawResult::Response(response))
    }

    /// Directives go to the interpreter verbatim; it reports acceptance or
    /// rejection itself.
    async fn forward_directive(&mut self, cell: &str) -> Result<Option<RawResult>, TransportError> {
        let response = self.round_trip(&Request::execute(cell)).await?;
        Ok(Some(RawResult::Response(response)))
    }

    async fn cancel(&mut self) -> Result<(), TransportError> {
        if !self.in_flight {
            return Ok(());
        }
        warn!("[bridge] Round trip abandoned mid-flight, stopping interpreter");
        self.terminate().await;
        Err(TransportError::Interrupted)
    }

    async fn terminate(&mut self) {
        // Closing stdin first lets a well-behaved interpreter exit on EOF.
        self.pipes = None;
        if let Some(mut process) = self.process.take() {
            process.kill().await;
            info!(
                "[bridge] Persistent interpreter stopped after {} round trips",
                self.round_trips
            );
        }
    }

    fn protocol(&self) -> Protocol {
        Protocol::JsonLine
    }
}
