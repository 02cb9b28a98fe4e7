use std::collections::BTreeMap;
use std::time::Duration;

use super::{exchange_collecting, SnapshotError};
use crate::session::Exchange;
use crate::types::{FrameVariables, Record, Value};
use crate::{MiError, Result};

/// Lists every variable of frame `level` in thread `thread_id`, values
/// included.
pub async fn frame_variables<E: Exchange>(
    exchange: &E,
    thread_id: &str,
    level: &str,
    timeout: Duration,
) -> std::result::Result<FrameVariables, SnapshotError> {
    let mut skipped = Vec::new();
    match collect_frame_variables(exchange, thread_id, level, timeout, &mut skipped).await {
        Ok(variables) => Ok(FrameVariables { variables, skipped }),
        Err(source) => Err(SnapshotError { source, skipped }),
    }
}

pub(super) async fn collect_frame_variables<E: Exchange>(
    exchange: &E,
    thread_id: &str,
    level: &str,
    timeout: Duration,
    skipped: &mut Vec<Vec<Record>>,
) -> Result<Vec<Value>> {
    let command = format!(
        "-stack-list-variables --thread {} --frame {} --all-values",
        thread_id, level
    );
    let response = exchange_collecting(exchange, &command, timeout, skipped).await?;
    let record = response.record();
    if record.is_error() {
        return Err(MiError::invalid_response(format!(
            "'{}' failed: {}",
            command,
            error_text(record)
        )));
    }

    match record.get("variables") {
        Some(Value::List(values)) => Ok(values.clone()),
        // Some gdb builds emit `variables=[name="x",...]` without braces.
        Some(Value::Results(results)) => Ok(results
            .iter()
            .map(|nv| Value::Tuple(BTreeMap::from([(nv.name.clone(), nv.value.clone())])))
            .collect()),
        other => Err(MiError::invalid_response(format!(
            "unexpected 'variables' value: {:?}",
            other
        ))),
    }
}

pub(crate) fn error_text(record: &Record) -> &str {
    record
        .get("msg")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
}
