//! Turning raw interpreter results into notebook outputs.

use irust_protocol::Response;
use jupyter_protocol::JupyterMessageContent;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::bridge::RawResult;

/// One output produced by a cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DisplayEvent {
    /// Plain text on a named stream (always `stdout` here).
    Stream { name: String, text: String },
    /// Mime-typed rich output, one `mime → value` entry.
    DisplayData {
        metadata: Map<String, Value>,
        data: Map<String, Value>,
    },
}

impl DisplayEvent {
    pub fn stdout(text: impl Into<String>) -> Self {
        DisplayEvent::Stream {
            name: "stdout".to_string(),
            text: text.into(),
        }
    }

    pub fn display_data(mime_type: impl Into<String>, value: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert(mime_type.into(), Value::String(value.into()));
        DisplayEvent::DisplayData {
            metadata: Map::new(),
            data,
        }
    }

    /// Jupyter message type carrying this event on iopub.
    pub fn msg_type(&self) -> &'static str {
        match self {
            DisplayEvent::Stream { .. } => "stream",
            DisplayEvent::DisplayData { .. } => "display_data",
        }
    }

    /// Convert into iopub message content.
    pub fn to_content(&self) -> Result<JupyterMessageContent, serde_json::Error> {
        let content = serde_json::to_value(self)?;
        JupyterMessageContent::from_type_and_content(self.msg_type(), content)
    }

    /// Best plain-text rendering, for terminals.
    pub fn plain_text(&self) -> Option<&str> {
        match self {
            DisplayEvent::Stream { text, .. } => Some(text.as_str()),
            DisplayEvent::DisplayData { data, .. } => data
                .get(irust_protocol::mime::PLAIN_TEXT)
                .or_else(|| data.values().next())
                .and_then(Value::as_str),
        }
    }
}

/// Map a raw result onto the notebook's output channels.
///
/// Captured text always becomes one stream event. A parsed response becomes
/// one display_data event when it carries `Eval`, and nothing otherwise.
pub fn translate(result: RawResult) -> Vec<DisplayEvent> {
    match result {
        RawResult::Text(text) => vec![DisplayEvent::stdout(text)],
        RawResult::Response(Response::Eval(output)) => {
            vec![DisplayEvent::display_data(output.mime_type, output.value)]
        }
        RawResult::Response(Response::Silent) => Vec::new(),
    }
}
