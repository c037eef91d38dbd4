use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bot::handle_update;
use crate::bot::telegram::{TelegramApi, Update};
use crate::watch::WatchScheduler;

const RETRY_PAUSE: Duration = Duration::from_secs(5);

/// Long-polls the Bot API until `shutdown` fires. Transport failures are
/// logged and retried after a short pause.
pub async fn run_polling(
    api: TelegramApi,
    scheduler: WatchScheduler,
    poll_timeout_secs: u64,
    shutdown: CancellationToken,
) -> Result<()> {
    api.delete_webhook()
        .await
        .context("failed removing webhook before long polling")?;
    info!(poll_timeout_secs, "polling for bot updates");

    let mut offset: Option<i64> = None;
    loop {
        let batch = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            batch = api.get_updates(offset, poll_timeout_secs) => batch,
        };

        let updates = match batch {
            Ok(updates) => updates,
            Err(err) => {
                warn!("getUpdates failed, retrying in {}s: {err}", RETRY_PAUSE.as_secs());
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_PAUSE) => continue,
                }
            }
        };

        if !updates.is_empty() {
            debug!(count = updates.len(), "received updates");
        }
        offset = next_offset(offset, &updates);
        for update in &updates {
            handle_update(&api, &scheduler, update).await;
        }
    }

    info!("update polling stopped");
    Ok(())
}

/// Telegram confirms updates up to `offset - 1`; keep the highest id seen.
fn next_offset(current: Option<i64>, updates: &[Update]) -> Option<i64> {
    updates
        .iter()
        .map(|update| update.update_id + 1)
        .chain(current)
        .max()
}
