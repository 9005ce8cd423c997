//! Start-condition evaluation against the status table.

use std::time::Duration;
use tokio::sync::watch;

use crate::error::{OrchError, Result};
use crate::model::{Action, StartCondition};
use crate::status::{StatusTable, TableSnapshot};

/// Whether `action` may be dispatched given `table`.
pub fn condition_met(table: &StatusTable, action: &Action) -> bool {
    match &action.start_condition {
        StartCondition::NoWait => true,
        StartCondition::WaitForEndpoint => table.endpoint_idle(&action.server, &action.operation),
        StartCondition::WaitForServer => table.server_idle(&action.server),
        StartCondition::WaitForAll => table.all_idle(),
        StartCondition::WaitFor { endpoints } => table.endpoints_idle(endpoints),
    }
}

/// Wait until `action`'s start condition holds.
///
/// Re-checks only when a new table snapshot is published. `NoWait` returns
/// without looking at the table at all.
pub async fn wait_for_start(
    snapshots: &mut watch::Receiver<TableSnapshot>,
    action: &Action,
    timeout: Option<Duration>,
) -> Result<()> {
    if action.start_condition == StartCondition::NoWait {
        return Ok(());
    }
    match timeout {
        Some(limit) => tokio::time::timeout(limit, poll_until_met(snapshots, action))
            .await
            .map_err(|_| OrchError::StartConditionTimeout(limit))?,
        None => poll_until_met(snapshots, action).await,
    }
}

async fn poll_until_met(
    snapshots: &mut watch::Receiver<TableSnapshot>,
    action: &Action,
) -> Result<()> {
    loop {
        if condition_met(&snapshots.borrow_and_update().table, action) {
            return Ok(());
        }
        snapshots.changed().await.map_err(|_| OrchError::Closed)?;
    }
}
