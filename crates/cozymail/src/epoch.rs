//! Keeps the cache in step with the server's UID numbering.

use std::collections::HashSet;

use cozymail_core::{Account, MessageCache, UidEpoch};
use cozymail_mail::{RemoteMailbox, SearchQuery};

use crate::watcher::WatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EpochOutcome {
    /// UIDVALIDITY unchanged (or not reported); vanished UIDs were dropped.
    Pruned { removed: u64 },
    /// New UIDVALIDITY; every cached row of the account was dropped.
    Reset { removed: u64, epoch: UidEpoch },
}

/// Selects `folder` and leaves it selected.
pub(crate) async fn reconcile_epoch(
    cache: &dyn MessageCache,
    mailbox: &mut dyn RemoteMailbox,
    account: &Account,
    folder: &str,
) -> Result<EpochOutcome, WatchError> {
    mailbox.select(folder).await.map_err(WatchError::Remote)?;
    let status = mailbox
        .folder_status(folder)
        .await
        .map_err(WatchError::Remote)?;
    let present: HashSet<u32> = mailbox
        .search(SearchQuery::All)
        .await
        .map_err(WatchError::Remote)?
        .into_iter()
        .collect();
    let last_uid = status
        .last_uid()
        .or_else(|| present.iter().copied().max());

    match status.uid_validity {
        Some(uid_validity) if account.uid_validity != Some(uid_validity) => {
            let epoch = UidEpoch {
                uid_validity,
                last_uid: last_uid.unwrap_or(0),
            };
            let removed = cache
                .reset_epoch(account.id, epoch)
                .await
                .map_err(WatchError::Storage)?;
            tracing::info!(
                account_id = account.id,
                old = ?account.uid_validity,
                new = uid_validity,
                removed,
                "uid epoch changed, cache reset"
            );
            Ok(EpochOutcome::Reset { removed, epoch })
        }
        _ => {
            if status.uid_validity.is_none() {
                tracing::debug!(account_id = account.id, folder, "server reported no UIDVALIDITY");
            }
            let removed = cache
                .prune_missing(account.id, &present, last_uid)
                .await
                .map_err(WatchError::Storage)?;
            if removed > 0 {
                tracing::info!(account_id = account.id, removed, "pruned vanished messages");
            }
            Ok(EpochOutcome::Pruned { removed })
        }
    }
}
