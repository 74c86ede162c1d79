//! Line-oriented REPL on the terminal, one line per cell.

use std::io::Write;

use anyhow::Result;
use log::debug;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::bridge::Transport;
use crate::dispatcher::ExecutionDispatcher;

/// Feed each non-empty line of `input` to the dispatcher and print the
/// outputs to `output`. Stops at end of input or once the dispatcher is
/// defunct. Errors are printed, not returned.
pub async fn run<T, R, W>(
    dispatcher: &mut ExecutionDispatcher<T>,
    input: R,
    output: &mut W,
) -> Result<()>
where
    T: Transport,
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await? {
        let cell = line.trim_end();
        if cell.is_empty() {
            continue;
        }

        match dispatcher.dispatch(cell, false).await {
            Ok(dispatched) => {
                debug!("[console] {:?} ({} outputs)", dispatched.action, dispatched.events.len());
                for event in &dispatched.events {
                    if let Some(text) = event.plain_text() {
                        write!(output, "{}", text)?;
                        if !text.ends_with('\n') {
                            writeln!(output)?;
                        }
                    }
                }
            }
            Err(e) => {
                writeln!(output, "error: {}", e)?;
                if dispatcher.is_defunct() {
                    break;
                }
            }
        }
        output.flush()?;
    }

    Ok(())
}
