//! Cell classification.
//!
//! A cell's action is derived from its raw text every time it is submitted;
//! the result is never stored.

const ADD_MARKER: &str = ":add";
const TOOLCHAIN_MARKER: &str = ":toolchain";

/// What the dispatcher should do with a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive<'a> {
    /// `:add <spec>`: declare a crate dependency. A bare `:add` yields an
    /// empty spec, which the session ignores; with the one-shot bridge such a
    /// cell does nothing at all.
    AddDependency(&'a str),
    /// `:toolchain <name>`: switch release channel.
    SetToolchain(&'a str),
    /// Buffer the cell for a later evaluation.
    SilentAccumulate,
    /// Evaluate pending statements plus the cell.
    Evaluate,
}

impl<'a> Directive<'a> {
    /// Classify `cell`. Rules apply in order: `:add`, `:toolchain`,
    /// silent or `;`-terminated, evaluate.
    pub fn classify(cell: &'a str, silent: bool) -> Self {
        if let Some(spec) = cell.strip_prefix(ADD_MARKER) {
            return Directive::AddDependency(spec.trim());
        }

        if let Some(name) = toolchain_name(cell) {
            return Directive::SetToolchain(name);
        }

        if silent || cell.trim().ends_with(';') {
            Directive::SilentAccumulate
        } else {
            Directive::Evaluate
        }
    }
}

/// The name token after `:toolchain`, if the marker is followed by
/// whitespace and a name.
fn toolchain_name(cell: &str) -> Option<&str> {
    let rest = cell.strip_prefix(TOOLCHAIN_MARKER)?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    rest.split_whitespace().next()
}
