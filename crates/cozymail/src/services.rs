use std::sync::Arc;

use anyhow::{Context, Result};

use cozymail_classifier::{
    ClassCounts, FsModelStore, Label, SpamClassifier, TrainingReport, TrainingSample,
};
use cozymail_core::{
    Account, AccountLog, FileAccountLog, MessageCache, SqliteMessageCache, UserId,
};
use cozymail_mail::{ImapConnector, MailLogin, MailboxConnector, RemoteMailbox};

use crate::config::ServiceConfig;
use crate::credentials::{CredentialStore, KeyFileCredentials};
use crate::notify::{HttpNotifier, NotificationSink, NullNotifier};
use crate::watcher::WatchError;

/// Handles shared by every account task. Each one is safe to use from many
/// watchers at once.
pub(crate) struct Services {
    pub(crate) cache: Arc<dyn MessageCache>,
    pub(crate) connector: Arc<dyn MailboxConnector>,
    pub(crate) credentials: Arc<dyn CredentialStore>,
    pub(crate) classifier: Arc<SpamClassifier>,
    pub(crate) notifier: Arc<dyn NotificationSink>,
    pub(crate) log: Arc<dyn AccountLog>,
    pub(crate) config: ServiceConfig,
}

impl Services {
    /// Wires the production implementations from the configuration. The
    /// database is created and migrated on first use.
    pub(crate) async fn open(config: ServiceConfig) -> Result<Self> {
        let cache = open_cache(&config).await?;
        let credentials = KeyFileCredentials::load(&config.storage.key_file)
            .context("credential key missing; run `cozymail init` first")?;
        let notifier: Arc<dyn NotificationSink> = match config.notify.endpoint.as_deref() {
            Some(endpoint) => Arc::new(HttpNotifier::new(endpoint, config.notify.timeout)?),
            None => Arc::new(NullNotifier),
        };
        Ok(Self {
            cache: Arc::new(cache),
            connector: Arc::new(ImapConnector),
            credentials: Arc::new(credentials),
            classifier: Arc::new(SpamClassifier::new(Arc::new(FsModelStore::new(
                config.storage.model_dir.clone(),
            )))),
            notifier,
            log: Arc::new(FileAccountLog::new(config.storage.log_dir.clone())),
            config,
        })
    }

    pub(crate) fn mail_login(&self, account: &Account) -> Result<MailLogin, WatchError> {
        let password = self.credentials.decrypt(&account.password_enc)?;
        MailLogin::from_server(
            &account.server,
            self.config.imap.default_port,
            &account.login,
            &password,
            self.config.imap.skip_tls_verify,
        )
        .map_err(WatchError::Remote)
    }

    /// Model artifacts live on disk and each user's model sits behind a
    /// lock, so classifier work runs on the blocking pool.
    pub(crate) async fn predict(&self, user: UserId, subject: &str, body: &str) -> Label {
        let classifier = self.classifier.clone();
        let (subject, body) = (subject.to_string(), body.to_string());
        match tokio::task::spawn_blocking(move || classifier.predict(user, &subject, &body)).await
        {
            Ok(label) => label,
            Err(err) => {
                tracing::warn!(user_id = %user, error = %err, "classifier task failed, treating as ham");
                Label::Ham
            }
        }
    }

    pub(crate) async fn train_incremental(
        &self,
        user: UserId,
        subject: &str,
        body: &str,
        label: Label,
    ) -> Result<Option<ClassCounts>> {
        let classifier = self.classifier.clone();
        let (subject, body) = (subject.to_string(), body.to_string());
        tokio::task::spawn_blocking(move || {
            classifier.train_incremental(user, &subject, &body, label)
        })
        .await?
    }

    pub(crate) async fn train_bulk(
        &self,
        user: UserId,
        samples: Vec<TrainingSample>,
    ) -> Result<Option<TrainingReport>> {
        let classifier = self.classifier.clone();
        tokio::task::spawn_blocking(move || classifier.train_bulk(user, &samples)).await?
    }

    pub(crate) async fn connect(
        &self,
        account: &Account,
    ) -> Result<Box<dyn RemoteMailbox>, WatchError> {
        let login = self.mail_login(account)?;
        tracing::debug!(account_id = account.id, host = %login.host, "connecting");
        self.connector
            .connect(&login)
            .await
            .map_err(WatchError::Remote)
    }
}

pub(crate) async fn open_cache(config: &ServiceConfig) -> Result<SqliteMessageCache> {
    if let Some(parent) = config.storage.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let path = config
        .storage
        .db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("database path is not valid UTF-8"))?;
    let cache = SqliteMessageCache::connect(path).await?;
    cache.init().await?;
    Ok(cache)
}
