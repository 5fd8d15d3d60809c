//! Applies user decisions queued on cached messages back to the server and
//! feeds them to the classifier.

use cozymail_classifier::Label;
use cozymail_content::first_address;
use cozymail_core::{Account, CachedMessage, PendingAction};
use cozymail_mail::{MailFlag, RemoteMailbox};

use crate::config::WhitelistScope;
use crate::services::Services;
use crate::watcher::WatchError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct WriteBackReport {
    pub(crate) spam: usize,
    pub(crate) deleted: usize,
    pub(crate) ham: usize,
    pub(crate) remote_failures: usize,
}

/// Runs on the watcher's own connection with the inbox selected. Remote
/// failures are logged and the local row still moves on; only storage
/// failures abort the pass.
pub(crate) async fn process_flagged(
    services: &Services,
    account: &Account,
    mailbox: &mut dyn RemoteMailbox,
) -> Result<WriteBackReport, WatchError> {
    let pending = services
        .cache
        .pending_actions(account.id)
        .await
        .map_err(WatchError::Storage)?;
    let mut report = WriteBackReport::default();
    for message in pending {
        let Some(action) = message.pending_action else {
            continue;
        };
        match action {
            PendingAction::Spam => {
                train(services, account, &message, Label::Spam).await;
                let flagged = mailbox.add_flags(&[message.uid], &[MailFlag::Junk]).await;
                let moved = mailbox.move_to(message.uid, &account.junk_folder).await;
                let ok = remote_step(services, account, &message, "flag junk", flagged)
                    & remote_step(services, account, &message, "move to junk", moved);
                report.remote_failures += usize::from(!ok);
                delete_row(services, &message).await?;
                report.spam += 1;
            }
            PendingAction::Deleted => {
                let flagged = mailbox.add_flags(&[message.uid], &[MailFlag::Seen]).await;
                let moved = mailbox.move_to(message.uid, &account.trash_folder).await;
                let ok = remote_step(services, account, &message, "flag seen", flagged)
                    & remote_step(services, account, &message, "move to trash", moved);
                report.remote_failures += usize::from(!ok);
                delete_row(services, &message).await?;
                report.deleted += 1;
            }
            PendingAction::Ham => {
                train(services, account, &message, Label::Ham).await;
                let sender = whitelist_entry(
                    &first_address(&message.sender),
                    services.config.training.ham_whitelist,
                );
                let added = services
                    .cache
                    .add_whitelist_entry(account.user_id, None, &sender)
                    .await
                    .map_err(WatchError::Storage)?;
                if added {
                    tracing::info!(account_id = account.id, sender = %sender, "sender whitelisted");
                }
                services
                    .cache
                    .clear_pending_action(message.id)
                    .await
                    .map_err(WatchError::Storage)?;
                report.ham += 1;
            }
        }
    }
    Ok(report)
}

async fn train(services: &Services, account: &Account, message: &CachedMessage, label: Label) {
    let body = if message.body.trim().is_empty() {
        message.raw.as_str()
    } else {
        message.body.as_str()
    };
    match services
        .train_incremental(account.user_id, &message.subject, body, label)
        .await
    {
        Ok(Some(counts)) => services.log.training(
            account,
            &format!(
                "incremental {:?} update from uid {}: spam={} ham={}",
                label, message.uid, counts.spam, counts.ham
            ),
        ),
        Ok(None) => {}
        Err(err) => services.log.error(
            account,
            &format!("incremental training failed for uid {}: {:#}", message.uid, err),
        ),
    }
}

/// Falls back to the address when it has no domain part.
fn whitelist_entry(address: &str, scope: WhitelistScope) -> String {
    match (scope, address.rsplit_once('@')) {
        (WhitelistScope::Domain, Some((_, domain))) if !domain.is_empty() => {
            format!("*@{}", domain)
        }
        _ => address.to_string(),
    }
}

fn remote_step(
    services: &Services,
    account: &Account,
    message: &CachedMessage,
    step: &str,
    result: anyhow::Result<()>,
) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => {
            services.log.error(
                account,
                &format!("write-back {} failed for uid {}: {:#}", step, message.uid, err),
            );
            false
        }
    }
}

async fn delete_row(services: &Services, message: &CachedMessage) -> Result<(), WatchError> {
    services
        .cache
        .delete_message(message.id)
        .await
        .map_err(WatchError::Storage)
}
