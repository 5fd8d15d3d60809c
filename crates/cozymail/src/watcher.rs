//! Long-lived per-account loop: connect, wait for the server to report
//! changes, then drain new mail through the decision pipeline and write back
//! queued user decisions.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

use cozymail_classifier::Label;
use cozymail_content::parse_message;
use cozymail_core::{Account, FetchedMessage, SpamLogEntry};
use cozymail_mail::{MailFlag, RemoteMailbox, SearchQuery, is_imap_bye};

use crate::credentials::CredentialError;
use crate::epoch::{EpochOutcome, reconcile_epoch};
use crate::flagged::{WriteBackReport, process_flagged};
use crate::notify::NewMailEvent;
use crate::pipeline::{Disposition, judge, screen, wants_model};
use crate::services::Services;

#[derive(Debug, Error)]
pub(crate) enum WatchError {
    #[error("credentials: {0}")]
    Credentials(#[from] CredentialError),
    #[error("remote: {0:#}")]
    Remote(anyhow::Error),
    #[error("storage: {0:#}")]
    Storage(anyhow::Error),
}

impl WatchError {
    /// Storage failures end the task; everything else is retried in place.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(self, WatchError::Storage(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchState {
    Connecting,
    Waiting,
    Draining,
    Reconciling,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DrainReport {
    pub(crate) routed: usize,
    pub(crate) accepted: usize,
    pub(crate) junked: usize,
    pub(crate) skipped: usize,
    pub(crate) failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CycleReport {
    pub(crate) epoch: EpochOutcome,
    pub(crate) drained: DrainReport,
    pub(crate) write_back: WriteBackReport,
}

pub(crate) struct IdleWatcher {
    services: Arc<Services>,
    account_id: i64,
    state: WatchState,
}

impl IdleWatcher {
    pub(crate) fn new(services: Arc<Services>, account_id: i64) -> Self {
        Self {
            services,
            account_id,
            state: WatchState::Connecting,
        }
    }

    pub(crate) fn state(&self) -> WatchState {
        self.state
    }

    fn set_state(&mut self, state: WatchState) {
        if self.state != state {
            tracing::debug!(account_id = self.account_id, from = ?self.state, to = ?state, "watcher state");
            self.state = state;
        }
    }

    /// Runs until shutdown is signalled, the account disappears or storage
    /// fails. Connection and credential problems are logged and retried.
    pub(crate) async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), WatchError> {
        tracing::info!(account_id = self.account_id, "watcher started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(WatchState::Connecting);
            let Some(account) = self.load_account().await? else {
                tracing::info!(account_id = self.account_id, "account removed, stopping watcher");
                break;
            };
            match self.session(&account, &mut shutdown).await {
                Ok(()) => break,
                Err(err) if err.is_fatal() => {
                    self.set_state(WatchState::Error);
                    self.services
                        .log
                        .error(&account, &format!("watcher stopped: {}", err));
                    return Err(err);
                }
                Err(err) => {
                    self.set_state(WatchState::Error);
                    self.services
                        .log
                        .error(&account, &format!("watch cycle failed: {}", err));
                    let backoff = self.services.config.watcher.retry_backoff;
                    if sleep_or_shutdown(backoff, &mut shutdown).await {
                        break;
                    }
                }
            }
        }
        tracing::info!(account_id = self.account_id, "watcher stopped");
        Ok(())
    }

    /// One connection's lifetime. `Ok` means stop watching.
    async fn session(
        &mut self,
        account: &Account,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), WatchError> {
        let mut mailbox = self.services.connect(account).await?;
        let result = self.serve(&mut *mailbox, shutdown).await;
        if let Err(err) = mailbox.logout().await {
            tracing::debug!(account_id = self.account_id, error = %err, "logout failed");
        }
        result
    }

    async fn serve(
        &mut self,
        mailbox: &mut dyn RemoteMailbox,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), WatchError> {
        let inbox = self.services.config.watcher.inbox.clone();
        self.set_state(WatchState::Reconciling);
        let Some(account) = self.load_account().await? else {
            return Ok(());
        };
        reconcile_epoch(self.services.cache.as_ref(), mailbox, &account, &inbox).await?;

        let idle_timeout = self.services.config.watcher.idle_timeout;
        loop {
            self.set_state(WatchState::Waiting);
            let outcome = tokio::select! {
                outcome = mailbox.idle(idle_timeout) => outcome.map_err(WatchError::Remote)?,
                _ = shutdown.changed() => return Ok(()),
            };
            tracing::debug!(account_id = self.account_id, ?outcome, "woke from idle");
            if self.run_cycle(mailbox).await?.is_none() {
                return Ok(());
            }
            if *shutdown.borrow() {
                return Ok(());
            }
        }
    }

    /// Everything that follows a wake-up. `None` when the account was
    /// removed in the meantime.
    pub(crate) async fn run_cycle(
        &mut self,
        mailbox: &mut dyn RemoteMailbox,
    ) -> Result<Option<CycleReport>, WatchError> {
        let Some(account) = self.load_account().await? else {
            return Ok(None);
        };
        let inbox = self.services.config.watcher.inbox.clone();

        self.set_state(WatchState::Reconciling);
        let epoch = reconcile_epoch(self.services.cache.as_ref(), mailbox, &account, &inbox).await?;

        self.set_state(WatchState::Draining);
        let drained = self.drain(mailbox, &account).await?;

        self.set_state(WatchState::Reconciling);
        let write_back = process_flagged(&self.services, &account, mailbox).await?;
        self.push_read_flags(mailbox, &account).await?;

        tracing::info!(
            account_id = account.id,
            routed = drained.routed,
            accepted = drained.accepted,
            junked = drained.junked,
            failed = drained.failed,
            write_backs = write_back.spam + write_back.deleted + write_back.ham,
            "cycle complete"
        );
        Ok(Some(CycleReport {
            epoch,
            drained,
            write_back,
        }))
    }

    async fn drain(
        &self,
        mailbox: &mut dyn RemoteMailbox,
        account: &Account,
    ) -> Result<DrainReport, WatchError> {
        let cache = &self.services.cache;
        let uids = mailbox
            .search(SearchQuery::Unseen)
            .await
            .map_err(WatchError::Remote)?;
        let cached = cache
            .cached_uids(account.id)
            .await
            .map_err(WatchError::Storage)?;
        let rules = cache
            .active_rules(account.id)
            .await
            .map_err(WatchError::Storage)?;
        let whitelist = cache
            .whitelist_for(account)
            .await
            .map_err(WatchError::Storage)?;

        let mut report = DrainReport::default();
        for uid in uids {
            if cached.contains(&uid) {
                report.skipped += 1;
                continue;
            }
            let raw = match mailbox.fetch_raw(uid).await {
                Ok(raw) => raw,
                Err(err) if is_imap_bye(&err) => return Err(WatchError::Remote(err)),
                Err(err) => {
                    self.services
                        .log
                        .error(account, &format!("fetch of uid {} failed: {:#}", uid, err));
                    report.failed += 1;
                    continue;
                }
            };
            let message = match parse_message(uid, &raw) {
                Ok(message) => message,
                Err(err) => {
                    self.services
                        .log
                        .error(account, &format!("parse of uid {} failed: {:#}", uid, err));
                    report.failed += 1;
                    continue;
                }
            };
            let disposition = match screen(&message, &rules, &whitelist) {
                Some(disposition) => disposition,
                None => {
                    let model_says_spam = wants_model(account)
                        && self
                            .services
                            .predict(account.user_id, &message.subject, &message.text)
                            .await
                            == Label::Spam;
                    judge(&message, account, model_says_spam)
                }
            };
            self.dispose(mailbox, account, message, disposition, &mut report)
                .await?;
        }
        Ok(report)
    }

    async fn dispose(
        &self,
        mailbox: &mut dyn RemoteMailbox,
        account: &Account,
        message: FetchedMessage,
        disposition: Disposition,
        report: &mut DrainReport,
    ) -> Result<(), WatchError> {
        let uid = message.uid;
        match disposition {
            Disposition::Route(hit) => {
                let seen = if hit.mark_read {
                    mailbox.add_flags(&[uid], &[MailFlag::Seen]).await
                } else {
                    mailbox.remove_flags(&[uid], &[MailFlag::Seen]).await
                };
                self.log_remote(account, uid, "set read state", seen);
                let moved = mailbox.move_to(uid, &hit.target_folder).await;
                if self.log_remote(account, uid, "rule move", moved) {
                    self.services
                        .cache
                        .record_rule_hit(hit.rule_id)
                        .await
                        .map_err(WatchError::Storage)?;
                }
                tracing::info!(
                    account_id = account.id,
                    uid,
                    rule_id = hit.rule_id,
                    folder = %hit.target_folder,
                    "routed by rule"
                );
                report.routed += 1;
            }
            Disposition::Accept { whitelisted } => {
                let inserted = self
                    .services
                    .cache
                    .insert_message(account, &message)
                    .await
                    .map_err(WatchError::Storage)?;
                if inserted && !whitelisted {
                    self.services
                        .notifier
                        .notify(NewMailEvent::new(account.id, &message.subject, uid))
                        .await;
                }
                tracing::debug!(account_id = account.id, uid, whitelisted, "cached");
                report.accepted += 1;
            }
            Disposition::Junk(verdict) => {
                let flagged = mailbox.add_flags(&[uid], &[MailFlag::Junk]).await;
                self.log_remote(account, uid, "flag junk", flagged);
                let moved = mailbox.move_to(uid, &account.junk_folder).await;
                self.log_remote(account, uid, "move to junk", moved);
                self.services.log.spam_decision(
                    account,
                    &SpamLogEntry {
                        date: message.date,
                        sender: message.from,
                        subject: message.subject,
                        score: verdict.level,
                        reason: verdict.reason(),
                    },
                );
                report.junked += 1;
            }
        }
        Ok(())
    }

    /// Mirrors locally read messages to the server in one store.
    async fn push_read_flags(
        &self,
        mailbox: &mut dyn RemoteMailbox,
        account: &Account,
    ) -> Result<(), WatchError> {
        let uids = self
            .services
            .cache
            .read_uids(account.id)
            .await
            .map_err(WatchError::Storage)?;
        if uids.is_empty() {
            return Ok(());
        }
        if let Err(err) = mailbox.add_flags(&uids, &[MailFlag::Seen]).await {
            self.services.log.error(
                account,
                &format!("syncing read flags for {} messages failed: {:#}", uids.len(), err),
            );
        }
        Ok(())
    }

    fn log_remote(&self, account: &Account, uid: u32, step: &str, result: anyhow::Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(err) => {
                self.services
                    .log
                    .error(account, &format!("{} for uid {} failed: {:#}", step, uid, err));
                false
            }
        }
    }

    async fn load_account(&self) -> Result<Option<Account>, WatchError> {
        self.services
            .cache
            .get_account(self.account_id)
            .await
            .map_err(WatchError::Storage)
    }
}

/// True when shutdown was requested before `delay` elapsed.
pub(crate) async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
