//! irust-kernel - Jupyter kernel for the IRust `re` interpreter.
//!
//! Each notebook cell is one step of a long-lived REPL session. The
//! [`dispatcher::ExecutionDispatcher`] decides per cell whether to record a
//! dependency, switch toolchain, buffer a statement or evaluate, and drives a
//! [`bridge::Transport`] that talks to the interpreter process in one of two
//! protocol generations:
//!
//! - `oneshot`: spawn `re <deps> <code>` per evaluation and capture stdout
//! - `json-line`: one persistent `re` process speaking NDJSON
//!
//! Results are turned into notebook outputs by [`translator`], and
//! [`kernel`] serves the whole thing over the Jupyter messaging protocol.

pub mod bridge;
pub mod console;
pub mod directive;
pub mod dispatcher;
pub mod interpreter;
pub mod kernel;
pub mod session;
pub mod settings;
pub mod translator;

/// Name the kernel is registered under with Jupyter.
pub const KERNEL_NAME: &str = "irust";

/// Implementation version reported in `kernel_info_reply`.
pub const KERNEL_VERSION: &str = env!("CARGO_PKG_VERSION");
