//! Per-cell execution state machine.
//!
//! Every submitted cell is classified with [`Directive::classify`] and turned
//! into exactly one of four actions. Only the dispatcher mutates the
//! [`Session`], and each cell costs at most one transport round trip.

use log::{debug, error, info};

use crate::bridge::{RawResult, Transport, TransportError};
use crate::directive::Directive;
use crate::session::{Session, Toolchain};
use crate::translator::{translate, DisplayEvent};

/// The action taken for a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    AddDependency,
    SetToolchain,
    Accumulate,
    Evaluate,
}

/// Result of dispatching one cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub action: Action,
    /// Outputs to show for the cell, possibly none.
    pub events: Vec<DisplayEvent>,
    /// Session execution count after the cell.
    pub execution_count: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("interpreter session is no longer usable ({reason}); restart the kernel")]
    Defunct { reason: String },
}

/// Drives one [`Session`] against one [`Transport`].
///
/// Transport failures are fatal: the transport is terminated and every later
/// cell fails with [`DispatchError::Defunct`].
pub struct ExecutionDispatcher<T> {
    session: Session,
    transport: T,
    fault: Option<String>,
}

impl<T: Transport> ExecutionDispatcher<T> {
    pub fn new(transport: T) -> Self {
        Self::with_session(Session::new(), transport)
    }

    pub fn with_session(session: Session, transport: T) -> Self {
        Self {
            session,
            transport,
            fault: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Why the session stopped working, if it did.
    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    pub fn is_defunct(&self) -> bool {
        self.fault.is_some()
    }

    /// Handle one cell.
    ///
    /// Interpreter-reported errors are ordinary output; only bridge failures
    /// produce `Err`.
    pub async fn dispatch(&mut self, cell: &str, silent: bool) -> Result<Dispatched, DispatchError> {
        if let Some(reason) = &self.fault {
            return Err(DispatchError::Defunct {
                reason: reason.clone(),
            });
        }

        match Directive::classify(cell, silent) {
            Directive::AddDependency(spec) => {
                if self.session.append_dependency(spec) {
                    info!("[dispatcher] Added dependency {:?}", spec);
                } else {
                    debug!("[dispatcher] Dependency {:?} already declared", spec);
                }
                let events = match self.forward(cell).await? {
                    Some(raw) => translate(raw),
                    None => Vec::new(),
                };
                Ok(self.dispatched(Action::AddDependency, events))
            }

            Directive::SetToolchain(name) => {
                let parsed = name.parse::<Toolchain>();
                if let Ok(toolchain) = parsed {
                    info!("[dispatcher] Switching toolchain to {}", toolchain);
                    self.session.set_toolchain(toolchain);
                }
                let events = match (self.forward(cell).await?, parsed) {
                    (Some(raw), _) => translate(raw),
                    (None, Ok(_)) => Vec::new(),
                    (None, Err(unknown)) => vec![DisplayEvent::stdout(format!("{unknown}\n"))],
                };
                Ok(self.dispatched(Action::SetToolchain, events))
            }

            Directive::SilentAccumulate => {
                self.session.accumulate(cell);
                Ok(self.dispatched(Action::Accumulate, Vec::new()))
            }

            Directive::Evaluate => {
                let execution_count = self.session.next_execution_count();
                let mut snapshot = self.session.take_snapshot();
                snapshot.code.push_str(cell);

                debug!(
                    "[dispatcher] Evaluating cell {} ({} bytes)",
                    execution_count,
                    snapshot.code.len()
                );

                let raw = match self.transport.evaluate(&snapshot).await {
                    Ok(raw) => raw,
                    Err(e) => return Err(self.fail(e).await),
                };
                Ok(self.dispatched(Action::Evaluate, translate(raw)))
            }
        }
    }

    /// Call after dropping an in-flight [`dispatch`](Self::dispatch) future.
    pub async fn cancel(&mut self) -> Result<(), DispatchError> {
        match self.transport.cancel().await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Stop the interpreter. The dispatcher is defunct afterwards.
    pub async fn shutdown(&mut self) {
        self.transport.terminate().await;
        self.fault.get_or_insert_with(|| "kernel shut down".to_string());
    }

    async fn forward(&mut self, cell: &str) -> Result<Option<RawResult>, DispatchError> {
        match self.transport.forward_directive(cell).await {
            Ok(raw) => Ok(raw),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn fail(&mut self, e: TransportError) -> DispatchError {
        error!("[dispatcher] Transport failure, session is now defunct: {}", e);
        self.fault = Some(e.to_string());
        self.transport.terminate().await;
        DispatchError::Transport(e)
    }

    fn dispatched(&self, action: Action, events: Vec<DisplayEvent>) -> Dispatched {
        Dispatched {
            action,
            events,
            execution_count: self.session.execution_count(),
        }
    }
}
