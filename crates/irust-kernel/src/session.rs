//! Per-kernel REPL session state.
//!
//! Owned by exactly one dispatcher; nothing here performs I/O.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Rust release channel the interpreter should compile with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Toolchain {
    #[default]
    Stable,
    Beta,
    Nightly,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown toolchain `{0}` (expected stable, beta or nightly)")]
pub struct UnknownToolchain(pub String);

impl FromStr for Toolchain {
    type Err = UnknownToolchain;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stable" => Ok(Toolchain::Stable),
            "beta" => Ok(Toolchain::Beta),
            "nightly" => Ok(Toolchain::Nightly),
            _ => Err(UnknownToolchain(s.to_string())),
        }
    }
}

impl fmt::Display for Toolchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Toolchain::Stable => write!(f, "stable"),
            Toolchain::Beta => write!(f, "beta"),
            Toolchain::Nightly => write!(f, "nightly"),
        }
    }
}

/// What a transport needs to run one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Code to evaluate: pending statements, plus the cell once the
    /// dispatcher appends it.
    pub code: String,
    /// Dependencies joined by a single space, in declaration order.
    pub dependencies: String,
    pub toolchain: Toolchain,
}

/// Accumulated state of one REPL session.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pending_code: String,
    dependencies: Vec<String>,
    toolchain: Toolchain,
    execution_count: usize,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a dependency spec. Exact, case-sensitive duplicates and empty
    /// specs are ignored. Returns whether the spec was added.
    pub fn append_dependency(&mut self, spec: &str) -> bool {
        if spec.is_empty() || self.dependencies.iter().any(|dep| dep == spec) {
            return false;
        }
        self.dependencies.push(spec.to_string());
        true
    }

    /// Append code verbatim to the pending buffer.
    pub fn accumulate(&mut self, code: &str) {
        self.pending_code.push_str(code);
    }

    pub fn set_toolchain(&mut self, toolchain: Toolchain) {
        self.toolchain = toolchain;
    }

    /// Bump the execution counter and return the new value.
    pub fn next_execution_count(&mut self) -> usize {
        self.execution_count += 1;
        self.execution_count
    }

    pub fn take_snapshot(&self) -> Snapshot {
        Snapshot {
            code: self.pending_code.clone(),
            dependencies: self.joined_dependencies(),
            toolchain: self.toolchain,
        }
    }

    /// Dependencies in the form passed to the one-shot interpreter.
    pub fn joined_dependencies(&self) -> String {
        self.dependencies.join(" ")
    }

    pub fn pending_code(&self) -> &str {
        &self.pending_code
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn toolchain(&self) -> Toolchain {
        self.toolchain
    }

    pub fn execution_count(&self) -> usize {
        self.execution_count
    }
}
