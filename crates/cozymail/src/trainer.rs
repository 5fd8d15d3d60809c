//! Bulk training from what users already filed: the junk folder is spam, the
//! inbox is ham.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;

use cozymail_classifier::{Label, TrainingReport, TrainingSample};
use cozymail_content::parse_message;
use cozymail_core::{Account, UserId};
use cozymail_mail::{RemoteMailbox, SearchQuery};

use crate::services::Services;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct UserTraining {
    pub(crate) user_id: i64,
    pub(crate) accounts: Vec<i64>,
    pub(crate) failed_accounts: Vec<i64>,
    pub(crate) spam_samples: usize,
    pub(crate) ham_samples: usize,
    pub(crate) vocabulary: Option<usize>,
    /// Set when fitting failed; the previous model stays in place.
    pub(crate) error: Option<String>,
}

/// Trains one model per user from the union of that user's accounts. A user
/// whose fit fails is reported and the next user still trains.
pub(crate) async fn train_users(services: &Services, accounts: Vec<Account>) -> Vec<UserTraining> {
    let mut by_user: BTreeMap<UserId, Vec<Account>> = BTreeMap::new();
    for account in accounts {
        by_user.entry(account.user_id).or_default().push(account);
    }

    let mut results = Vec::new();
    for (user, accounts) in by_user {
        let mut summary = UserTraining {
            user_id: user.0,
            ..UserTraining::default()
        };
        let mut samples = Vec::new();
        let mut trained = Vec::new();
        for account in accounts {
            match collect_account(services, &account).await {
                Ok(collected) => {
                    let spam = count(&collected, Label::Spam);
                    summary.spam_samples += spam;
                    summary.ham_samples += collected.len() - spam;
                    summary.accounts.push(account.id);
                    samples.extend(collected);
                    trained.push(account);
                }
                Err(err) => {
                    tracing::warn!(account_id = account.id, error = %err, "training data unavailable");
                    services
                        .log
                        .error(&account, &format!("training collection failed: {:#}", err));
                    summary.failed_accounts.push(account.id);
                }
            }
        }

        match services.train_bulk(user, samples).await {
            Ok(report) => {
                summary.vocabulary = report.map(|r| r.vocabulary);
                for account in &trained {
                    services.log.training(account, &training_line(&summary, report));
                }
            }
            Err(err) => {
                tracing::error!(user_id = %user, error = %err, "bulk training failed");
                let line = format!("bulk training failed: {:#}", err);
                for account in &trained {
                    services.log.training(account, &line);
                    services.log.error(account, &line);
                }
                summary.error = Some(format!("{:#}", err));
            }
        }
        results.push(summary);
    }
    results
}

fn count(samples: &[TrainingSample], label: Label) -> usize {
    samples.iter().filter(|s| s.label == label).count()
}

fn training_line(summary: &UserTraining, report: Option<TrainingReport>) -> String {
    match report {
        Some(report) => format!(
            "bulk training: spam={} ham={} vocabulary={}",
            report.counts.spam, report.counts.ham, report.vocabulary
        ),
        None => format!(
            "bulk training skipped: no usable samples (spam={} ham={})",
            summary.spam_samples, summary.ham_samples
        ),
    }
}

async fn collect_account(services: &Services, account: &Account) -> Result<Vec<TrainingSample>> {
    let mut mailbox = services.connect(account).await?;
    let limits = &services.config.training;
    let inbox = services.config.watcher.inbox.clone();
    let collected = async {
        let mut samples =
            sample_folder(&mut *mailbox, &account.junk_folder, limits.spam_limit, Label::Spam)
                .await?;
        samples.extend(sample_folder(&mut *mailbox, &inbox, limits.ham_limit, Label::Ham).await?);
        anyhow::Ok(samples)
    }
    .await;
    if let Err(err) = mailbox.logout().await {
        tracing::debug!(account_id = account.id, error = %err, "logout failed");
    }
    let samples = collected?;
    tracing::info!(account_id = account.id, samples = samples.len(), "training data collected");
    Ok(samples)
}

/// Newest `limit` messages of `folder` with a non-empty text body.
async fn sample_folder(
    mailbox: &mut dyn RemoteMailbox,
    folder: &str,
    limit: usize,
    label: Label,
) -> Result<Vec<TrainingSample>> {
    mailbox.select(folder).await?;
    let mut uids = mailbox.search(SearchQuery::All).await?;
    uids.sort_unstable_by(|a, b| b.cmp(a));

    let mut samples = Vec::new();
    for uid in uids.into_iter().take(limit) {
        let raw = match mailbox.fetch_raw(uid).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::debug!(folder, uid, error = %err, "skipping unfetchable message");
                continue;
            }
        };
        let Ok(message) = parse_message(uid, &raw) else {
            tracing::debug!(folder, uid, "skipping unparsable message");
            continue;
        };
        if message.text.trim().is_empty() {
            continue;
        }
        samples.push(TrainingSample {
            subject: message.subject,
            body: message.text,
            label,
        });
    }
    Ok(samples)
}
