use std::time::Duration;

use thiserror::Error;

use super::exchange_collecting;
use super::frame_vars::{collect_frame_variables, error_text};
use crate::session::Exchange;
use crate::types::{FrameInfo, Record, Response, ThreadInfo, ThreadSnapshot, Value};
use crate::{MiError, Result};

/// A failed multi-step query. Nothing of the partial result is kept except
/// the record batches that went unmatched along the way.
#[derive(Debug, Error)]
#[error("gdb query failed: {source}")]
pub struct SnapshotError {
    #[source]
    pub source: MiError,
    pub skipped: Vec<Vec<Record>>,
}

/// Every thread with its stack, and every frame with its variables.
pub async fn thread_snapshot<E: Exchange>(
    exchange: &E,
    timeout: Duration,
) -> std::result::Result<ThreadSnapshot, SnapshotError> {
    let mut skipped = Vec::new();
    match collect_threads(exchange, timeout, &mut skipped).await {
        Ok(threads) => Ok(ThreadSnapshot { threads, skipped }),
        Err(source) => {
            tracing::warn!("thread snapshot aborted: {}", source);
            Err(SnapshotError { source, skipped })
        }
    }
}

async fn collect_threads<E: Exchange>(
    exchange: &E,
    timeout: Duration,
    skipped: &mut Vec<Vec<Record>>,
) -> Result<Vec<ThreadInfo>> {
    let response = exchange_collecting(exchange, "-thread-info", timeout, skipped).await?;
    let listed = field(&response, "-thread-info", "threads")?
        .as_list()
        .ok_or_else(|| unexpected("threads", response.record().get("threads")))?;

    let mut threads = Vec::with_capacity(listed.len());
    for entry in listed {
        let fields = entry
            .as_tuple()
            .ok_or_else(|| unexpected("thread", Some(entry)))?
            .clone();
        let id = fields
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| unexpected("thread id", fields.get("id")))?
            .to_string();

        let stack = collect_stack(exchange, &id, timeout, skipped).await?;
        threads.push(ThreadInfo { fields, stack });
    }
    Ok(threads)
}

async fn collect_stack<E: Exchange>(
    exchange: &E,
    thread_id: &str,
    timeout: Duration,
    skipped: &mut Vec<Vec<Record>>,
) -> Result<Vec<FrameInfo>> {
    let command = format!("-stack-list-frames --thread {thread_id}");
    let response = exchange_collecting(exchange, &command, timeout, skipped).await?;
    let stack = field(&response, &command, "stack")?;

    let frames = match stack {
        Value::Results(frames) => frames.iter().map(|nv| &nv.value).collect::<Vec<_>>(),
        other if other.is_empty_list() => Vec::new(),
        other => return Err(unexpected("stack", Some(other))),
    };

    let mut stack = Vec::with_capacity(frames.len());
    for frame in frames {
        let fields = frame
            .as_tuple()
            .ok_or_else(|| unexpected("frame", Some(frame)))?
            .clone();
        let level = fields
            .get("level")
            .and_then(Value::as_str)
            .ok_or_else(|| unexpected("frame level", fields.get("level")))?
            .to_string();

        let variables = collect_frame_variables(exchange, thread_id, &level, timeout, skipped).await?;
        stack.push(FrameInfo { fields, variables });
    }
    Ok(stack)
}

/// Looks up `name` on the reply record, turning `^error` into a failure.
fn field<'a>(response: &'a Response, command: &str, name: &str) -> Result<&'a Value> {
    let record = response.record();
    if record.is_error() {
        return Err(MiError::invalid_response(format!(
            "'{}' failed: {}",
            command,
            error_text(record)
        )));
    }
    record
        .get(name)
        .ok_or_else(|| MiError::invalid_response(format!("reply to '{command}' has no '{name}'")))
}

fn unexpected(what: &str, value: Option<&Value>) -> MiError {
    MiError::invalid_response(format!("unexpected {what} value: {value:?}"))
}
