//! Wire protocol between the IRust kernel and a persistent `re` interpreter.
//!
//! Messages are newline-delimited JSON (NDJSON): the kernel writes one
//! [`Request`] per line and the interpreter answers with exactly one line,
//! parsed into a [`Response`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Mime type names used on the wire.
pub mod mime {
    pub const PLAIN_TEXT: &str = "text/plain";
}

/// Requests the kernel sends to the interpreter.
///
/// Serialized externally tagged: `{"Execute":{"code":"1+1"}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Request {
    /// Evaluate, insert or interpret `code`; the interpreter decides which.
    Execute { code: String },
}

impl Request {
    pub fn execute(code: impl Into<String>) -> Self {
        Request::Execute { code: code.into() }
    }

    /// Serialize request to JSON line (with newline terminator).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Payload of an `Eval` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalOutput {
    pub mime_type: String,
    pub value: String,
}

/// A response line from the interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The interpreter produced a value to display.
    Eval(EvalOutput),
    /// Any other acknowledgement: `{}`, `"Insert"`, `"AddDependency"`, ...
    Silent,
}

impl Response {
    pub fn eval(mime_type: impl Into<String>, value: impl Into<String>) -> Self {
        Response::Eval(EvalOutput {
            mime_type: mime_type.into(),
            value: value.into(),
        })
    }

    /// Parse response from JSON line.
    ///
    /// The line must be valid JSON. Only an object carrying an `Eval` key is
    /// interpreted; everything else is a silent acknowledgement.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line.trim())?;
        Self::from_value(value)
    }

    pub fn from_value(mut value: Value) -> Result<Self, serde_json::Error> {
        match value.get_mut("Eval").map(Value::take) {
            Some(eval) => Ok(Response::Eval(serde_json::from_value(eval)?)),
            None => Ok(Response::Silent),
        }
    }

    /// Serialize response to JSON line (with newline terminator).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let value = match self {
            Response::Eval(output) => serde_json::json!({ "Eval": output }),
            Response::Silent => serde_json::json!({}),
        };
        let mut line = serde_json::to_string(&value)?;
        line.push('\n');
        Ok(line)
    }
}
