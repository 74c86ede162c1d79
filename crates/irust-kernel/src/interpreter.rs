//! Locating the `re` interpreter binary.
//!
//! Resolution order:
//! 1. An explicit path from settings or the command line
//! 2. `re` inside the user's Jupyter kernel directory for this kernel
//! 3. `re` on PATH

use std::path::{Path, PathBuf};

use log::info;
use tokio::process::Command;

use crate::KERNEL_NAME;

/// File name of the interpreter binary.
#[cfg(windows)]
pub const INTERPRETER_BINARY: &str = "re.exe";
#[cfg(not(windows))]
pub const INTERPRETER_BINARY: &str = "re";

/// Program plus leading arguments; per-call arguments are appended after
/// these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpreterCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl InterpreterCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Wrap the program for the platform shell. On Windows the interpreter
    /// is started through `cmd /c`.
    pub fn for_platform(self) -> Self {
        if cfg!(windows) {
            let mut args = vec!["/c".to_string(), self.program.to_string_lossy().into_owned()];
            args.extend(self.args);
            Self {
                program: PathBuf::from("cmd"),
                args,
            }
        } else {
            self
        }
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }

    /// Program name for log and error messages.
    pub fn display_name(&self) -> String {
        self.program.display().to_string()
    }
}

/// Jupyter's per-user data directory.
///
/// `JUPYTER_DATA_DIR` wins; otherwise the platform default Jupyter uses.
pub fn jupyter_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("JUPYTER_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if cfg!(target_os = "macos") {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Library")
            .join("Jupyter")
    } else {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("jupyter")
    }
}

/// Directory the kernel spec (and a bundled interpreter) is installed into.
pub fn kernel_dir() -> PathBuf {
    jupyter_data_dir().join("kernels").join(KERNEL_NAME)
}

/// Pick the interpreter to run.
pub fn resolve(explicit: Option<&Path>) -> InterpreterCommand {
    resolve_in(explicit, &kernel_dir())
}

fn resolve_in(explicit: Option<&Path>, kernel_dir: &Path) -> InterpreterCommand {
    if let Some(path) = explicit {
        info!("[interpreter] Using configured interpreter {:?}", path);
        return InterpreterCommand::new(path).for_platform();
    }

    let bundled = kernel_dir.join(INTERPRETER_BINARY);
    if bundled.is_file() {
        info!("[interpreter] Using interpreter from kernel dir {:?}", bundled);
        return InterpreterCommand::new(bundled).for_platform();
    }

    info!("[interpreter] Using `re` from PATH");
    InterpreterCommand::new("re").for_platform()
}
