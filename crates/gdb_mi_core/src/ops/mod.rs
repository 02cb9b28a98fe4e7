//! Multi-step queries composed from token-correlated exchanges.

mod frame_vars;
mod threads;

pub use frame_vars::frame_variables;
pub use threads::{thread_snapshot, SnapshotError};

use std::time::Duration;

use crate::session::Exchange;
use crate::types::{Record, Response};
use crate::Result;

/// Runs one exchange and moves its skipped batches into `skipped`, whether
/// or not it succeeded.
async fn exchange_collecting<E: Exchange>(
    exchange: &E,
    command: &str,
    timeout: Duration,
    skipped: &mut Vec<Vec<Record>>,
) -> Result<Response> {
    match exchange.exchange(command, timeout).await {
        Ok(mut response) => {
            skipped.append(&mut response.skipped);
            Ok(response)
        }
        Err(mut err) => {
            skipped.append(&mut err.take_skipped());
            Err(err)
        }
    }
}
