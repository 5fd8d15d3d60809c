//! In-memory stand-ins for the server, logs and notifications, plus a
//! harness wiring them to a temp-file SQLite cache.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use cozymail_classifier::{
    ArtifactKind, Label, MemoryModelStore, ModelStore, SpamClassifier, TrainingSample,
};
use cozymail_content::parse_message;
use cozymail_core::{
    Account, AccountLog, FetchedMessage, MessageCache, PendingAction, SpamLogEntry,
    SqliteMessageCache, UserId,
};
use cozymail_mail::{
    FolderStatus, IdleOutcome, MailFlag, MailLogin, MailboxConnector, RemoteMailbox, SearchQuery,
};

use crate::config::parse_service_config;
use crate::credentials::{CredentialError, CredentialStore};
use crate::notify::{NewMailEvent, NotificationSink};
use crate::services::Services;

pub(crate) const INBOX: &str = "INBOX";
pub(crate) const JUNK: &str = "Junk";
pub(crate) const TRASH: &str = "INBOX.Trash";

pub(crate) fn sample_account(id: i64) -> Account {
    Account {
        id,
        user_id: UserId(1),
        email: "me@example.com".to_string(),
        login: format!("me{}", id),
        password_enc: "secret".to_string(),
        server: "imap.test".to_string(),
        junk_folder: JUNK.to_string(),
        trash_folder: TRASH.to_string(),
        spam_level_threshold: None,
        classification_enabled: true,
        uid_validity: None,
        last_seen_uid: None,
    }
}

pub(crate) fn sample_login() -> MailLogin {
    MailLogin {
        host: "imap.test".to_string(),
        port: 993,
        username: "me1".to_string(),
        password: "secret".to_string(),
        skip_tls_verify: false,
    }
}

static MESSAGE_SEQ: AtomicU32 = AtomicU32::new(1);

pub(crate) fn raw_message(from: &str, subject: &str, body: &str) -> Vec<u8> {
    raw_message_with(from, subject, body, &[])
}

pub(crate) fn raw_message_with(
    from: &str,
    subject: &str,
    body: &str,
    extra_headers: &[(&str, &str)],
) -> Vec<u8> {
    let seq = MESSAGE_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut raw = format!(
        "From: {}\r\nTo: me@example.com\r\nSubject: {}\r\nMessage-ID: <m{}@test>\r\n\
         Date: Mon, 1 Jan 2024 10:00:00 +0000\r\n",
        from, subject, seq
    );
    for (key, value) in extra_headers {
        raw.push_str(&format!("{}: {}\r\n", key, value));
    }
    raw.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
    raw.push_str(body);
    raw.push_str("\r\n");
    raw.into_bytes()
}

pub(crate) fn lottery_corpus() -> Vec<TrainingSample> {
    let sample = |subject: &str, body: &str, label| TrainingSample {
        subject: subject.to_string(),
        body: body.to_string(),
        label,
    };
    vec![
        sample("Lottery results", "Claim your lottery prize today", Label::Spam),
        sample("Congratulations", "The lottery picked your ticket", Label::Spam),
        sample("Final lottery notice", "Lottery winnings waiting", Label::Spam),
        sample("Invoice 1041", "Please find the invoice attached", Label::Ham),
        sample("March invoice", "Invoice for consulting hours", Label::Ham),
        sample("Overdue invoice", "Reminder about the open invoice", Label::Ham),
    ]
}

struct FakeMessage {
    raw: Vec<u8>,
    seen: bool,
}

struct FakeFolder {
    next_uid: u32,
    messages: BTreeMap<u32, FakeMessage>,
}

impl FakeFolder {
    fn new() -> Self {
        Self {
            next_uid: 1,
            messages: BTreeMap::new(),
        }
    }

    fn append(&mut self, message: FakeMessage) -> u32 {
        let uid = self.next_uid;
        self.next_uid += 1;
        self.messages.insert(uid, message);
        uid
    }
}

struct FakeState {
    uid_validity: Option<u32>,
    folders: BTreeMap<String, FakeFolder>,
    flags_added: Vec<(u32, MailFlag)>,
    flags_removed: Vec<(u32, MailFlag)>,
    moves: Vec<(u32, String)>,
    fetches: Vec<u32>,
    passwords: Vec<String>,
    fail_moves: bool,
    fail_connect: bool,
    fail_fetch: HashSet<u32>,
    hold_idle: bool,
}

/// A single-user IMAP server held in memory. Clones share state.
#[derive(Clone)]
pub(crate) struct FakeServer {
    state: Arc<Mutex<FakeState>>,
}

impl FakeServer {
    pub(crate) fn new() -> Self {
        let folders = [INBOX, JUNK, TRASH]
            .into_iter()
            .map(|name| (name.to_string(), FakeFolder::new()))
            .collect();
        Self {
            state: Arc::new(Mutex::new(FakeState {
                uid_validity: Some(100),
                folders,
                flags_added: Vec::new(),
                flags_removed: Vec::new(),
                moves: Vec::new(),
                fetches: Vec::new(),
                passwords: Vec::new(),
                fail_moves: false,
                fail_connect: false,
                fail_fetch: HashSet::new(),
                hold_idle: false,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn create_folder(&self, name: &str) {
        self.state()
            .folders
            .entry(name.to_string())
            .or_insert_with(FakeFolder::new);
    }

    pub(crate) fn deliver(&self, folder: &str, raw: Vec<u8>) -> u32 {
        self.deliver_flagged(folder, raw, false)
    }

    pub(crate) fn deliver_flagged(&self, folder: &str, raw: Vec<u8>, seen: bool) -> u32 {
        self.state()
            .folders
            .entry(folder.to_string())
            .or_insert_with(FakeFolder::new)
            .append(FakeMessage { raw, seen })
    }

    pub(crate) fn expunge(&self, folder: &str, uid: u32) {
        if let Some(folder) = self.state().folders.get_mut(folder) {
            folder.messages.remove(&uid);
        }
    }

    pub(crate) fn set_uid_validity(&self, uid_validity: Option<u32>) {
        self.state().uid_validity = uid_validity;
    }

    pub(crate) fn fail_moves(&self, fail: bool) {
        self.state().fail_moves = fail;
    }

    pub(crate) fn fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    pub(crate) fn fail_fetch(&self, uid: u32) {
        self.state().fail_fetch.insert(uid);
    }

    /// IDLE waits for its whole timeout instead of returning at once.
    pub(crate) fn hold_idle(&self, hold: bool) {
        self.state().hold_idle = hold;
    }

    pub(crate) fn folder_len(&self, folder: &str) -> usize {
        self.state()
            .folders
            .get(folder)
            .map(|f| f.messages.len())
            .unwrap_or(0)
    }

    pub(crate) fn is_seen(&self, folder: &str, uid: u32) -> bool {
        self.state()
            .folders
            .get(folder)
            .and_then(|f| f.messages.get(&uid))
            .map(|m| m.seen)
            .unwrap_or(false)
    }

    pub(crate) fn raw(&self, folder: &str, uid: u32) -> Result<Vec<u8>> {
        self.state()
            .folders
            .get(folder)
            .and_then(|f| f.messages.get(&uid))
            .map(|m| m.raw.clone())
            .ok_or_else(|| anyhow!("no message {} in {}", uid, folder))
    }

    pub(crate) fn flags_added(&self) -> Vec<(u32, MailFlag)> {
        self.state().flags_added.clone()
    }

    pub(crate) fn flags_removed(&self) -> Vec<(u32, MailFlag)> {
        self.state().flags_removed.clone()
    }

    pub(crate) fn moves(&self) -> Vec<(u32, String)> {
        self.state().moves.clone()
    }

    pub(crate) fn fetches(&self) -> Vec<u32> {
        self.state().fetches.clone()
    }

    pub(crate) fn passwords(&self) -> Vec<String> {
        self.state().passwords.clone()
    }
}

#[async_trait]
impl MailboxConnector for FakeServer {
    async fn connect(&self, login: &MailLogin) -> Result<Box<dyn RemoteMailbox>> {
        let mut state = self.state();
        if state.fail_connect {
            return Err(anyhow!("connection refused"));
        }
        state.passwords.push(login.password.clone());
        Ok(Box::new(FakeMailbox {
            state: self.state.clone(),
            selected: None,
        }))
    }
}

struct FakeMailbox {
    state: Arc<Mutex<FakeState>>,
    selected: Option<String>,
}

impl FakeMailbox {
    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn selected(&self) -> Result<String> {
        self.selected
            .clone()
            .ok_or_else(|| anyhow!("no folder selected"))
    }

    fn set_flags(&mut self, uids: &[u32], flags: &[MailFlag], on: bool) -> Result<()> {
        let folder = self.selected()?;
        let mut state = self.state();
        for uid in uids {
            for flag in flags {
                if on {
                    state.flags_added.push((*uid, *flag));
                } else {
                    state.flags_removed.push((*uid, *flag));
                }
                if *flag == MailFlag::Seen {
                    if let Some(message) = state
                        .folders
                        .get_mut(&folder)
                        .and_then(|f| f.messages.get_mut(uid))
                    {
                        message.seen = on;
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteMailbox for FakeMailbox {
    async fn select(&mut self, folder: &str) -> Result<()> {
        if !self.state().folders.contains_key(folder) {
            return Err(anyhow!("no such folder {}", folder));
        }
        self.selected = Some(folder.to_string());
        Ok(())
    }

    async fn folder_status(&mut self, folder: &str) -> Result<FolderStatus> {
        let state = self.state();
        let found = state
            .folders
            .get(folder)
            .ok_or_else(|| anyhow!("no such folder {}", folder))?;
        Ok(FolderStatus {
            uid_validity: state.uid_validity,
            uid_next: Some(found.next_uid),
        })
    }

    async fn search(&mut self, query: SearchQuery) -> Result<Vec<u32>> {
        let folder = self.selected()?;
        let state = self.state();
        let found = state
            .folders
            .get(&folder)
            .ok_or_else(|| anyhow!("no such folder {}", folder))?;
        Ok(found
            .messages
            .iter()
            .filter(|(_, m)| query == SearchQuery::All || !m.seen)
            .map(|(uid, _)| *uid)
            .collect())
    }

    async fn fetch_raw(&mut self, uid: u32) -> Result<Vec<u8>> {
        let folder = self.selected()?;
        let mut state = self.state();
        state.fetches.push(uid);
        if state.fail_fetch.contains(&uid) {
            return Err(anyhow!("fetch timed out"));
        }
        state
            .folders
            .get(&folder)
            .and_then(|f| f.messages.get(&uid))
            .map(|m| m.raw.clone())
            .ok_or_else(|| anyhow!("No body found for UID {}", uid))
    }

    async fn add_flags(&mut self, uids: &[u32], flags: &[MailFlag]) -> Result<()> {
        self.set_flags(uids, flags, true)
    }

    async fn remove_flags(&mut self, uids: &[u32], flags: &[MailFlag]) -> Result<()> {
        self.set_flags(uids, flags, false)
    }

    async fn move_to(&mut self, uid: u32, target: &str) -> Result<()> {
        let folder = self.selected()?;
        let mut state = self.state();
        if state.fail_moves {
            return Err(anyhow!("move rejected by server"));
        }
        if !state.folders.contains_key(target) {
            return Err(anyhow!("no such folder {}", target));
        }
        let message = state
            .folders
            .get_mut(&folder)
            .and_then(|f| f.messages.remove(&uid))
            .ok_or_else(|| anyhow!("no message {} in {}", uid, folder))?;
        if let Some(dest) = state.folders.get_mut(target) {
            dest.append(message);
        }
        state.moves.push((uid, target.to_string()));
        Ok(())
    }

    async fn idle(&mut self, timeout: Duration) -> Result<IdleOutcome> {
        let hold = self.state().hold_idle;
        let wait = if hold {
            timeout
        } else {
            timeout.min(Duration::from_millis(10))
        };
        tokio::time::sleep(wait).await;
        Ok(IdleOutcome::TimedOut)
    }

    async fn logout(&mut self) -> Result<()> {
        self.selected = None;
        Ok(())
    }
}

/// In-memory artifacts behind a blocking read, like a slow disk.
pub(crate) struct SlowModelStore {
    inner: MemoryModelStore,
    delay: Duration,
}

impl SlowModelStore {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryModelStore::new(),
            delay,
        }
    }
}

impl ModelStore for SlowModelStore {
    fn get(&self, user: UserId, kind: ArtifactKind) -> Result<Option<Vec<u8>>> {
        std::thread::sleep(self.delay);
        self.inner.get(user, kind)
    }

    fn put(&self, user: UserId, kind: ArtifactKind, bytes: &[u8]) -> Result<()> {
        self.inner.put(user, kind, bytes)
    }
}

/// Identity cipher; tokens starting with `bad` fail to decrypt.
pub(crate) struct PlainCredentials;

impl CredentialStore for PlainCredentials {
    fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        Ok(plaintext.to_string())
    }

    fn decrypt(&self, token: &str) -> Result<String, CredentialError> {
        if token.starts_with("bad") {
            return Err(CredentialError::Decryption("bad token".to_string()));
        }
        Ok(token.to_string())
    }
}

#[derive(Default)]
pub(crate) struct MemoryAccountLog {
    errors: Mutex<Vec<String>>,
    training: Mutex<Vec<String>>,
    spam: Mutex<Vec<SpamLogEntry>>,
}

fn push<T>(lines: &Mutex<Vec<T>>, value: T) {
    lines
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(value);
}

fn snapshot<T: Clone>(lines: &Mutex<Vec<T>>) -> Vec<T> {
    lines.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

impl MemoryAccountLog {
    pub(crate) fn error_lines(&self) -> Vec<String> {
        snapshot(&self.errors)
    }

    pub(crate) fn training_lines(&self) -> Vec<String> {
        snapshot(&self.training)
    }

    pub(crate) fn spam_entries(&self) -> Vec<SpamLogEntry> {
        snapshot(&self.spam)
    }
}

impl AccountLog for MemoryAccountLog {
    fn error(&self, _account: &Account, message: &str) {
        push(&self.errors, message.to_string());
    }

    fn training(&self, _account: &Account, message: &str) {
        push(&self.training, message.to_string());
    }

    fn spam_decision(&self, _account: &Account, entry: &SpamLogEntry) {
        push(&self.spam, entry.clone());
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    events: Mutex<Vec<NewMailEvent>>,
}

impl RecordingNotifier {
    pub(crate) fn events(&self) -> Vec<NewMailEvent> {
        snapshot(&self.events)
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(&self, event: NewMailEvent) {
        push(&self.events, event);
    }
}

pub(crate) struct Harness {
    pub(crate) services: Arc<Services>,
    pub(crate) cache: SqliteMessageCache,
    pub(crate) server: FakeServer,
    pub(crate) log: Arc<MemoryAccountLog>,
    pub(crate) notifier: Arc<RecordingNotifier>,
    _dir: tempfile::TempDir,
}

/// Account 1 of user 1 against a fresh fake server and database.
pub(crate) async fn harness() -> Result<Harness> {
    harness_with_store(Arc::new(MemoryModelStore::new())).await
}

pub(crate) async fn harness_with_store(store: Arc<dyn ModelStore>) -> Result<Harness> {
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("cozymail.db");
    let cache = SqliteMessageCache::connect(
        db_path
            .to_str()
            .ok_or_else(|| anyhow!("invalid temp db path"))?,
    )
    .await?;
    cache.init().await?;
    cache.upsert_user(UserId(1), "owner").await?;
    cache.upsert_account(&sample_account(1)).await?;

    let mut config = parse_service_config("", dir.path());
    config.watcher.idle_timeout = Duration::from_millis(10);
    config.watcher.retry_backoff = Duration::from_millis(10);
    config.supervisor.restart_backoff = Duration::from_millis(5);
    config.supervisor.restart_backoff_max = Duration::from_millis(20);

    let server = FakeServer::new();
    let log = Arc::new(MemoryAccountLog::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let services = Arc::new(Services {
        cache: Arc::new(cache.clone()),
        connector: Arc::new(server.clone()),
        credentials: Arc::new(PlainCredentials),
        classifier: Arc::new(SpamClassifier::new(store)),
        notifier: notifier.clone(),
        log: log.clone(),
        config,
    });
    Ok(Harness {
        services,
        cache,
        server,
        log,
        notifier,
        _dir: dir,
    })
}

impl Harness {
    pub(crate) async fn account(&self) -> Result<Account> {
        self.cache
            .get_account(1)
            .await?
            .ok_or_else(|| anyhow!("account 1 missing"))
    }

    pub(crate) fn fetched(&self, uid: u32) -> FetchedMessage {
        FetchedMessage {
            uid,
            from: "a@x.test".to_string(),
            sender_address: "a@x.test".to_string(),
            subject: format!("cached {}", uid),
            text: "body".to_string(),
            ..FetchedMessage::default()
        }
    }

    pub(crate) fn train_lottery_corpus(&self) -> Result<()> {
        self.services
            .classifier
            .train_bulk(UserId(1), &lottery_corpus())?
            .ok_or_else(|| anyhow!("training skipped"))?;
        Ok(())
    }

    /// Caches an inbox message as the watcher would and queues `action` on it.
    pub(crate) async fn cache_and_mark(&self, uid: u32, action: PendingAction) -> Result<i64> {
        let message = parse_message(uid, &self.server.raw(INBOX, uid)?)?;
        self.cache.insert_message(&self.account().await?, &message).await?;
        let id = self
            .cache
            .message_id_for_uid(1, uid)
            .await?
            .ok_or_else(|| anyhow!("row for uid {} missing", uid))?;
        self.cache.set_pending_action(id, Some(action)).await?;
        Ok(id)
    }
}
