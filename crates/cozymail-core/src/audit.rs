use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;

use crate::Account;

const ERROR_LOG: &str = "mailfilter.error.log";
const TRAIN_LOG: &str = "train.log";
const SPAM_LOG: &str = "mailfilter.log";

/// One routed-to-junk decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpamLogEntry {
    pub date: Option<String>,
    pub sender: String,
    pub subject: String,
    pub score: u32,
    pub reason: String,
}

impl SpamLogEntry {
    pub fn to_line(&self, timestamp: &str) -> String {
        format!(
            "{};{};{};{};{};{}",
            timestamp,
            self.date.as_deref().unwrap_or(""),
            flatten(&self.sender),
            flatten(&self.subject),
            self.score,
            self.reason
        )
    }
}

/// Per-account audit trail. Writes never fail the caller.
pub trait AccountLog: Send + Sync {
    fn error(&self, account: &Account, message: &str);
    fn training(&self, account: &Account, message: &str);
    fn spam_decision(&self, account: &Account, entry: &SpamLogEntry);
}

/// Appends to `<base>/<user_id>/<login>/{mailfilter.error.log,train.log,mailfilter.log}`.
pub struct FileAccountLog {
    base: PathBuf,
    write_lock: Mutex<()>,
}

impl FileAccountLog {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn account_dir(&self, account: &Account) -> PathBuf {
        self.base
            .join(account.user_id.to_string())
            .join(safe_segment(&account.login))
    }

    fn append(&self, account: &Account, file: &str, line: &str) {
        let dir = self.account_dir(account);
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Err(err) = append_line(&dir, file, line) {
            tracing::warn!(
                account_id = account.id,
                file,
                error = %err,
                "account log write failed"
            );
        }
    }
}

fn append_line(dir: &Path, file: &str, line: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut handle = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(file))?;
    writeln!(handle, "{}", line)
}

fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn flatten(value: &str) -> String {
    value.replace(['\r', '\n', ';'], " ")
}

fn safe_segment(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "_".to_string()
    } else {
        cleaned
    }
}

impl AccountLog for FileAccountLog {
    fn error(&self, account: &Account, message: &str) {
        tracing::warn!(account_id = account.id, "{}", message);
        let line = format!("{} - {}", timestamp(), flatten(message));
        self.append(account, ERROR_LOG, &line);
    }

    fn training(&self, account: &Account, message: &str) {
        tracing::info!(account_id = account.id, "{}", message);
        let line = format!("{} - {}", timestamp(), flatten(message));
        self.append(account, TRAIN_LOG, &line);
    }

    fn spam_decision(&self, account: &Account, entry: &SpamLogEntry) {
        tracing::info!(
            account_id = account.id,
            score = entry.score,
            reason = %entry.reason,
            "message routed to junk"
        );
        self.append(account, SPAM_LOG, &entry.to_line(&timestamp()));
    }
}

#[cfg(test)]
mod tests {
    use super::{AccountLog, FileAccountLog, SpamLogEntry};
    use crate::{Account, UserId};

    fn account() -> Account {
        Account {
            id: 3,
            user_id: UserId(9),
            email: "me@example.com".to_string(),
            login: "me@example.com".to_string(),
            password_enc: String::new(),
            server: "imap.example.com".to_string(),
            junk_folder: "Junk".to_string(),
            trash_folder: "Trash".to_string(),
            spam_level_threshold: Some(3),
            classification_enabled: true,
            uid_validity: None,
            last_seen_uid: None,
        }
    }

    #[test]
    fn spam_line_has_six_fields_and_no_embedded_separators() {
        let entry = SpamLogEntry {
            date: Some("2024-05-01T10:00:00+00:00".to_string()),
            sender: "Spammer <x@spam.test>".to_string(),
            subject: "Win; now\nfree".to_string(),
            score: 4,
            reason: "Level 4 ≥ 3, ML".to_string(),
        };
        let line = entry.to_line("2024-05-01 10:00:01");
        let fields: Vec<&str> = line.split(';').collect();
        assert_eq!(fields.len(), 6);
        assert_eq!(fields[3], "Win  now free");
        assert_eq!(fields[4], "4");
    }

    #[test]
    fn file_log_writes_per_account_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let log = FileAccountLog::new(dir.path());
        let account = account();
        log.error(&account, "connect failed");
        log.training(&account, "trained on 3 spam, 4 ham");
        log.spam_decision(
            &account,
            &SpamLogEntry {
                date: None,
                sender: "x@spam.test".to_string(),
                subject: "hi".to_string(),
                score: 0,
                reason: "ML".to_string(),
            },
        );

        let base = dir.path().join("9").join("me@example.com");
        let errors = std::fs::read_to_string(base.join("mailfilter.error.log"))?;
        assert!(errors.contains("connect failed"));
        let train = std::fs::read_to_string(base.join("train.log"))?;
        assert!(train.contains("3 spam"));
        let spam = std::fs::read_to_string(base.join("mailfilter.log"))?;
        assert!(spam.trim_end().ends_with(";0;ML"));
        Ok(())
    }
}
