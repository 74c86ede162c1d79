//! Jupyter kernel server.
//!
//! Binds the kernel side of the shell, control, iopub and heartbeat sockets
//! described by a connection file, and serves one request at a time. Cells
//! go through the [`ExecutionDispatcher`]; their display events are published
//! on iopub as children of the `execute_request`.

use std::path::Path;

use anyhow::{Context, Result};
use jupyter_protocol::{ConnectionInfo, ExecutionState, JupyterMessage, JupyterMessageContent, Status};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::bridge::{Bridge, Transport};
use crate::directive::Directive;
use crate::dispatcher::{DispatchError, Dispatched, ExecutionDispatcher};
use crate::session::Session;
use crate::settings::KernelSettings;
use crate::{KERNEL_NAME, KERNEL_VERSION};

const PROTOCOL_VERSION: &str = "5.3";

/// Build the dispatcher described by `settings`, spawning the persistent
/// interpreter if the protocol needs one.
pub fn start_dispatcher(settings: &KernelSettings) -> Result<ExecutionDispatcher<Bridge>> {
    let bridge = Bridge::from_settings(settings).context("Failed to start interpreter")?;
    let mut session = Session::new();
    session.set_toolchain(settings.toolchain);
    info!(
        "[kernel] Using {} protocol, toolchain {}",
        settings.protocol, settings.toolchain
    );
    Ok(ExecutionDispatcher::with_session(session, bridge))
}

pub async fn read_connection_file(path: &Path) -> Result<ConnectionInfo> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read connection file {:?}", path))?;
    serde_json::from_str::<ConnectionInfo>(&content)
        .with_context(|| format!("Invalid connection file {:?}", path))
}

struct Sockets {
    iopub: runtimelib::KernelIoPubConnection,
    shell: runtimelib::KernelShellConnection,
    control: runtimelib::KernelControlConnection,
}

enum Flow {
    Continue,
    Shutdown,
}

/// How an execute request ended.
enum Outcome {
    Finished(Result<Dispatched, DispatchError>),
    /// Abandoned by an interrupt. Holds the reason the transport could not
    /// recover, if it could not.
    Interrupted { cancel_error: Option<String> },
}

impl Outcome {
    /// `ename` and `evalue` of a failed cell.
    fn error(&self) -> Option<(&'static str, String)> {
        match self {
            Outcome::Finished(Ok(_)) => None,
            Outcome::Finished(Err(e @ DispatchError::Transport(_))) => {
                Some(("TransportError", e.to_string()))
            }
            Outcome::Finished(Err(e @ DispatchError::Defunct { .. })) => {
                Some(("KernelDefunct", e.to_string()))
            }
            Outcome::Interrupted { cancel_error: None } => {
                Some(("Interrupted", "cell execution was interrupted".to_string()))
            }
            Outcome::Interrupted {
                cancel_error: Some(reason),
            } => Some((
                "Interrupted",
                format!("cell execution was interrupted: {}", reason),
            )),
        }
    }
}

/// SIGINT, registered once for the kernel's lifetime so that an interrupt
/// never falls back to the default action and kills the kernel.
struct Interrupts {
    #[cfg(unix)]
    sigint: Option<tokio::signal::unix::Signal>,
}

impl Interrupts {
    fn register() -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let sigint = match signal(SignalKind::interrupt()) {
                Ok(sigint) => Some(sigint),
                Err(e) => {
                    warn!("[kernel] Cannot listen for SIGINT: {}", e);
                    None
                }
            };
            Self { sigint }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    /// Resolves on the next SIGINT.
    async fn recv(&mut self) {
        #[cfg(unix)]
        if let Some(sigint) = self.sigint.as_mut() {
            if sigint.recv().await.is_some() {
                return;
            }
        }
        #[cfg(not(unix))]
        if tokio::signal::ctrl_c().await.is_ok() {
            return;
        }
        std::future::pending::<()>().await
    }
}

pub struct KernelServer<T> {
    connection_info: ConnectionInfo,
    session_id: String,
    dispatcher: ExecutionDispatcher<T>,
}

impl<T: Transport> KernelServer<T> {
    pub fn new(connection_info: ConnectionInfo, dispatcher: ExecutionDispatcher<T>) -> Self {
        Self {
            connection_info,
            session_id: Uuid::new_v4().to_string(),
            dispatcher,
        }
    }

    /// Serve until a shutdown request or SIGTERM. The interpreter is
    /// terminated before returning, whatever the reason.
    pub async fn run(mut self) -> Result<()> {
        let mut interrupts = Interrupts::register();
        let info = &self.connection_info;
        let mut sockets = Sockets {
            iopub: runtimelib::create_kernel_iopub_connection(info, &self.session_id).await?,
            shell: runtimelib::create_kernel_shell_connection(info, &self.session_id).await?,
            control: runtimelib::create_kernel_control_connection(info, &self.session_id).await?,
        };
        let mut heartbeat = runtimelib::create_kernel_heartbeat_connection(info).await?;

        let heartbeat_task = tokio::spawn(async move {
            loop {
                if let Err(e) = heartbeat.single_heartbeat().await {
                    warn!("[kernel] Heartbeat stopped: {}", e);
                    break;
                }
            }
        });

        info!(
            "[kernel] {} kernel listening on {} (shell port {})",
            KERNEL_NAME, self.connection_info.ip, self.connection_info.shell_port
        );

        let result = self.serve(&mut sockets, &mut interrupts).await;

        heartbeat_task.abort();
        self.dispatcher.shutdown().await;
        info!("[kernel] Kernel shutdown complete");
        result
    }

    async fn serve(&mut self, sockets: &mut Sockets, interrupts: &mut Interrupts) -> Result<()> {
        let termination = termination();
        tokio::pin!(termination);

        loop {
            let flow = tokio::select! {
                message = sockets.shell.read() => {
                    self.handle_shell(sockets, interrupts, message?).await?
                }
                message = sockets.control.read() => {
                    handle_control(sockets, &message?).await?
                }
                _ = interrupts.recv() => {
                    debug!("[kernel] SIGINT while idle, nothing to interrupt");
                    Flow::Continue
                }
                _ = &mut termination => {
                    info!("[kernel] Received SIGTERM");
                    Flow::Shutdown
                }
            };
            if let Flow::Shutdown = flow {
                return Ok(());
            }
        }
    }

    async fn handle_shell(
        &mut self,
        sockets: &mut Sockets,
        interrupts: &mut Interrupts,
        message: JupyterMessage,
    ) -> Result<Flow> {
        debug!("[kernel] shell: {}", message.header.msg_type);

        match &message.content {
            JupyterMessageContent::ExecuteRequest(request) => {
                let code = request.code.clone();
                let silent = request.silent;
                return self.execute(sockets, interrupts, &message, code, silent).await;
            }
            JupyterMessageContent::KernelInfoRequest(_) => {
                publish_status(sockets, &message, ExecutionState::Busy).await?;
                sockets
                    .shell
                    .send(JupyterMessage::new(kernel_info_reply()?, Some(&message)))
                    .await?;
                publish_status(sockets, &message, ExecutionState::Idle).await?;
            }
            JupyterMessageContent::IsCompleteRequest(_) => {
                let content = content(
                    "is_complete_reply",
                    json!({ "status": "complete", "indent": "" }),
                )?;
                sockets.shell.send(JupyterMessage::new(content, Some(&message))).await?;
            }
            JupyterMessageContent::ShutdownRequest(request) => {
                let content = shutdown_reply(request.restart)?;
                sockets.shell.send(JupyterMessage::new(content, Some(&message))).await?;
                return Ok(Flow::Shutdown);
            }
            _ => {
                debug!(
                    "[kernel] Ignoring unsupported shell message {}",
                    message.header.msg_type
                );
            }
        }
        Ok(Flow::Continue)
    }

    async fn execute(
        &mut self,
        sockets: &mut Sockets,
        interrupts: &mut Interrupts,
        message: &JupyterMessage,
        code: String,
        silent: bool,
    ) -> Result<Flow> {
        publish_status(sockets, message, ExecutionState::Busy).await?;

        if !silent {
            let count = match Directive::classify(&code, silent) {
                Directive::Evaluate => self.dispatcher.session().execution_count() + 1,
                _ => self.dispatcher.session().execution_count(),
            };
            let input = content(
                "execute_input",
                json!({ "code": code, "execution_count": count }),
            )?;
            publish(sockets, message, input).await?;
        }

        let mut flow = Flow::Continue;
        let finished = {
            let dispatch = self.dispatcher.dispatch(&code, silent);
            tokio::pin!(dispatch);

            loop {
                tokio::select! {
                    result = &mut dispatch => break Some(result),
                    request = sockets.control.read() => {
                        let request = request?;
                        match &request.content {
                            JupyterMessageContent::InterruptRequest(_) => {
                                info!("[kernel] Interrupt requested");
                                sockets
                                    .control
                                    .send(JupyterMessage::new(interrupt_reply()?, Some(&request)))
                                    .await?;
                                break None;
                            }
                            JupyterMessageContent::ShutdownRequest(shutdown) => {
                                info!("[kernel] Shutdown requested during execution");
                                let reply = shutdown_reply(shutdown.restart)?;
                                sockets
                                    .control
                                    .send(JupyterMessage::new(reply, Some(&request)))
                                    .await?;
                                flow = Flow::Shutdown;
                                break None;
                            }
                            _ => {
                                handle_control(sockets, &request).await?;
                            }
                        }
                    }
                    _ = interrupts.recv() => {
                        info!("[kernel] SIGINT received, interrupting cell");
                        break None;
                    }
                }
            }
        };

        let outcome = match finished {
            Some(result) => Outcome::Finished(result),
            None => Outcome::Interrupted {
                cancel_error: self.dispatcher.cancel().await.err().map(|e| e.to_string()),
            },
        };
        if let Some((ename, evalue)) = outcome.error() {
            error!("[kernel] {}: {}", ename, evalue);
        }

        for output in iopub_messages(message, &outcome)? {
            sockets.iopub.send(output).await?;
        }
        let reply = content(
            "execute_reply",
            execute_reply(&outcome, self.dispatcher.session().execution_count()),
        )?;
        sockets.shell.send(JupyterMessage::new(reply, Some(message))).await?;
        publish_status(sockets, message, ExecutionState::Idle).await?;
        Ok(flow)
    }
}

/// Outputs of a finished cell, as children of its `execute_request`:
/// its display events, or one `error` output.
fn iopub_messages(parent: &JupyterMessage, outcome: &Outcome) -> Result<Vec<JupyterMessage>> {
    let contents = match (outcome, outcome.error()) {
        (_, Some((ename, evalue))) => vec![content("error", error_output(ename, &evalue))?],
        (Outcome::Finished(Ok(dispatched)), None) => dispatched
            .events
            .iter()
            .map(|event| event.to_content())
            .collect::<Result<Vec<_>, _>>()?,
        (_, None) => Vec::new(),
    };
    Ok(contents
        .into_iter()
        .map(|content| JupyterMessage::new(content, Some(parent)))
        .collect())
}

/// `execute_reply` content. Failed cells report `execution_count`, the
/// session's count after the attempt.
fn execute_reply(outcome: &Outcome, execution_count: usize) -> Value {
    match (outcome, outcome.error()) {
        (_, Some((ename, evalue))) => json!({
            "status": "error",
            "execution_count": execution_count,
            "payload": [],
            "user_expressions": {},
            "ename": ename,
            "traceback": [format!("{}: {}", ename, evalue)],
            "evalue": evalue,
        }),
        (Outcome::Finished(Ok(dispatched)), None) => json!({
            "status": "ok",
            "execution_count": dispatched.execution_count,
            "payload": [],
            "user_expressions": {},
        }),
        (_, None) => json!({
            "status": "ok",
            "execution_count": execution_count,
            "payload": [],
            "user_expressions": {},
        }),
    }
}

/// `error` iopub content.
fn error_output(ename: &str, evalue: &str) -> Value {
    json!({
        "ename": ename,
        "evalue": evalue,
        "traceback": [format!("{}: {}", ename, evalue)],
    })
}

async fn handle_control(sockets: &mut Sockets, message: &JupyterMessage) -> Result<Flow> {
    debug!("[kernel] control: {}", message.header.msg_type);

    match &message.content {
        JupyterMessageContent::ShutdownRequest(request) => {
            sockets
                .control
                .send(JupyterMessage::new(shutdown_reply(request.restart)?, Some(message)))
                .await?;
            return Ok(Flow::Shutdown);
        }
        JupyterMessageContent::InterruptRequest(_) => {
            // Nothing is running between cells.
            sockets
                .control
                .send(JupyterMessage::new(interrupt_reply()?, Some(message)))
                .await?;
        }
        JupyterMessageContent::KernelInfoRequest(_) => {
            sockets
                .control
                .send(JupyterMessage::new(kernel_info_reply()?, Some(message)))
                .await?;
        }
        _ => {
            debug!(
                "[kernel] Ignoring unsupported control message {}",
                message.header.msg_type
            );
        }
    }
    Ok(Flow::Continue)
}

/// Resolves on SIGTERM; never on platforms without it.
async fn termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                return;
            }
            Err(e) => warn!("[kernel] Cannot listen for SIGTERM: {}", e),
        }
    }
    std::future::pending::<()>().await
}

/// Build message content of `msg_type` from its JSON form.
fn content(msg_type: &str, value: Value) -> Result<JupyterMessageContent> {
    JupyterMessageContent::from_type_and_content(msg_type, value)
        .with_context(|| format!("Failed to build {} content", msg_type))
}

fn kernel_info_reply() -> Result<JupyterMessageContent> {
    content(
        "kernel_info_reply",
        json!({
            "status": "ok",
            "protocol_version": PROTOCOL_VERSION,
            "implementation": KERNEL_NAME,
            "implementation_version": KERNEL_VERSION,
            "language_info": {
                "name": "rust",
                "version": "1",
                "mimetype": "text/x-rust",
                "file_extension": ".rs",
                "pygments_lexer": "rust",
                "codemirror_mode": "rust",
                "nbconvert_exporter": "rust",
            },
            "banner": "IRust",
            "help_links": [],
            "debugger": false,
        }),
    )
}

fn interrupt_reply() -> Result<JupyterMessageContent> {
    content("interrupt_reply", json!({ "status": "ok" }))
}

fn shutdown_reply(restart: bool) -> Result<JupyterMessageContent> {
    content("shutdown_reply", json!({ "status": "ok", "restart": restart }))
}

async fn publish(
    sockets: &mut Sockets,
    parent: &JupyterMessage,
    content: JupyterMessageContent,
) -> Result<()> {
    sockets
        .iopub
        .send(JupyterMessage::new(content, Some(parent)))
        .await?;
    Ok(())
}

async fn publish_status(
    sockets: &mut Sockets,
    parent: &JupyterMessage,
    execution_state: ExecutionState,
) -> Result<()> {
    publish(
        sockets,
        parent,
        JupyterMessageContent::Status(Status { execution_state }),
    )
    .await
}
