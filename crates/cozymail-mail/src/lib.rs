//! Remote mailbox access (IMAP).

use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use imap::extensions::idle::WaitOutcome;
use imap::{ClientBuilder, ConnectionMode};
use serde::{Deserialize, Serialize};

pub const DEFAULT_IMAP_PORT: u16 = 993;

type ImapSession = imap::Session<imap::Connection>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailLogin {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub skip_tls_verify: bool,
}

impl MailLogin {
    /// `server` is `host` or `host:port`.
    pub fn from_server(
        server: &str,
        default_port: u16,
        username: &str,
        password: &str,
        skip_tls_verify: bool,
    ) -> Result<Self> {
        let (host, port) = split_host_port(server, default_port)?;
        Ok(Self {
            host,
            port,
            username: username.to_string(),
            password: password.to_string(),
            skip_tls_verify,
        })
    }
}

fn split_host_port(server: &str, default_port: u16) -> Result<(String, u16)> {
    let server = server.trim();
    if server.is_empty() {
        return Err(anyhow!("empty server address"));
    }
    match server.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => {
            let port = port
                .parse::<u16>()
                .map_err(|_| anyhow!("invalid port in server address {}", server))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((server.to_string(), default_port)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FolderStatus {
    pub uid_validity: Option<u32>,
    pub uid_next: Option<u32>,
}

impl FolderStatus {
    /// Highest UID assigned so far (`UIDNEXT - 1`).
    pub fn last_uid(&self) -> Option<u32> {
        self.uid_next.map(|next| next.saturating_sub(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchQuery {
    Unseen,
    All,
}

impl SearchQuery {
    fn as_imap(self) -> &'static str {
        match self {
            SearchQuery::Unseen => "UNSEEN",
            SearchQuery::All => "ALL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MailFlag {
    Seen,
    Junk,
}

impl MailFlag {
    fn as_imap(self) -> &'static str {
        match self {
            MailFlag::Seen => "\\Seen",
            MailFlag::Junk => "Junk",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    MailboxChanged,
    TimedOut,
}

/// One authenticated connection. Operations act on the selected folder and
/// run strictly one after another.
#[async_trait]
pub trait RemoteMailbox: Send {
    async fn select(&mut self, folder: &str) -> Result<()>;
    async fn folder_status(&mut self, folder: &str) -> Result<FolderStatus>;
    /// UIDs in ascending order.
    async fn search(&mut self, query: SearchQuery) -> Result<Vec<u32>>;
    /// Full message without setting `\Seen`.
    async fn fetch_raw(&mut self, uid: u32) -> Result<Vec<u8>>;
    async fn add_flags(&mut self, uids: &[u32], flags: &[MailFlag]) -> Result<()>;
    async fn remove_flags(&mut self, uids: &[u32], flags: &[MailFlag]) -> Result<()>;
    async fn move_to(&mut self, uid: u32, folder: &str) -> Result<()>;
    async fn idle(&mut self, timeout: Duration) -> Result<IdleOutcome>;
    async fn logout(&mut self) -> Result<()>;
}

#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn connect(&self, login: &MailLogin) -> Result<Box<dyn RemoteMailbox>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImapConnector;

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn connect(&self, login: &MailLogin) -> Result<Box<dyn RemoteMailbox>> {
        let login = login.clone();
        let session = tokio::task::spawn_blocking(move || imap_connect(&login)).await??;
        Ok(Box::new(ImapMailbox {
            session: Some(session),
            move_strategy: None,
        }))
    }
}

/// Blocking `imap` session driven from async code: each operation moves the
/// session onto the blocking pool and hands it back afterwards.
pub struct ImapMailbox {
    session: Option<ImapSession>,
    move_strategy: Option<MoveStrategy>,
}

/// How a single message leaves the selected folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveStrategy {
    /// RFC 6851 `UID MOVE`.
    Move,
    /// COPY, `\Deleted`, then `UID EXPUNGE` of just that UID (UIDPLUS).
    CopyUidExpunge,
    /// COPY, `\Deleted`, then a plain EXPUNGE. Also purges anything else
    /// already marked `\Deleted` in the folder.
    CopyExpunge,
}

impl MoveStrategy {
    fn from_capabilities(has_move: bool, has_uidplus: bool) -> Self {
        if has_move {
            MoveStrategy::Move
        } else if has_uidplus {
            MoveStrategy::CopyUidExpunge
        } else {
            MoveStrategy::CopyExpunge
        }
    }
}

impl ImapMailbox {
    async fn with_session<T, F>(&mut self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession) -> Result<T> + Send + 'static,
    {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| anyhow!("imap session is closed"))?;
        let (session, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut session);
            (session, result)
        })
        .await?;
        self.session = Some(session);
        result
    }
}

#[async_trait]
impl RemoteMailbox for ImapMailbox {
    async fn select(&mut self, folder: &str) -> Result<()> {
        let folder = folder.to_string();
        self.with_session(move |session| {
            session.select(&folder)?;
            Ok(())
        })
        .await
    }

    async fn folder_status(&mut self, folder: &str) -> Result<FolderStatus> {
        let folder = folder.to_string();
        self.with_session(move |session| {
            let status = session.status(&folder, "(UIDVALIDITY UIDNEXT)")?;
            Ok(FolderStatus {
                uid_validity: status.uid_validity,
                uid_next: status.uid_next,
            })
        })
        .await
    }

    async fn search(&mut self, query: SearchQuery) -> Result<Vec<u32>> {
        self.with_session(move |session| {
            let mut uids: Vec<u32> = session.uid_search(query.as_imap())?.into_iter().collect();
            uids.sort_unstable();
            Ok(uids)
        })
        .await
    }

    async fn fetch_raw(&mut self, uid: u32) -> Result<Vec<u8>> {
        self.with_session(move |session| {
            let fetches = session.uid_fetch(uid.to_string(), "BODY.PEEK[]")?;
            fetches
                .iter()
                .find_map(|f| f.body().map(|b| b.to_vec()))
                .ok_or_else(|| anyhow!("No body found for UID {}", uid))
        })
        .await
    }

    async fn add_flags(&mut self, uids: &[u32], flags: &[MailFlag]) -> Result<()> {
        if uids.is_empty() || flags.is_empty() {
            return Ok(());
        }
        let set = uid_set(uids);
        let query = format!("+FLAGS.SILENT ({})", flag_list(flags));
        self.with_session(move |session| {
            session.uid_store(&set, &query)?;
            Ok(())
        })
        .await
    }

    async fn remove_flags(&mut self, uids: &[u32], flags: &[MailFlag]) -> Result<()> {
        if uids.is_empty() || flags.is_empty() {
            return Ok(());
        }
        let set = uid_set(uids);
        let query = format!("-FLAGS.SILENT ({})", flag_list(flags));
        self.with_session(move |session| {
            session.uid_store(&set, &query)?;
            Ok(())
        })
        .await
    }

    async fn move_to(&mut self, uid: u32, folder: &str) -> Result<()> {
        let strategy = match self.move_strategy {
            Some(strategy) => strategy,
            None => {
                let strategy = self
                    .with_session(|session| {
                        let caps = session.capabilities()?;
                        Ok(MoveStrategy::from_capabilities(
                            caps.has_str("MOVE"),
                            caps.has_str("UIDPLUS"),
                        ))
                    })
                    .await?;
                tracing::debug!(?strategy, "imap move strategy");
                self.move_strategy = Some(strategy);
                strategy
            }
        };
        let folder = folder.to_string();
        self.with_session(move |session| {
            let uid_set = uid.to_string();
            if strategy == MoveStrategy::Move {
                session.uid_mv(&uid_set, &folder)?;
                return Ok(());
            }
            session.uid_copy(&uid_set, &folder)?;
            session.uid_store(&uid_set, "+FLAGS.SILENT (\\Deleted)")?;
            if strategy == MoveStrategy::CopyUidExpunge {
                session.uid_expunge(&uid_set)?;
            } else {
                session.expunge()?;
            }
            Ok(())
        })
        .await
    }

    async fn idle(&mut self, timeout: Duration) -> Result<IdleOutcome> {
        self.with_session(move |session| {
            let outcome = session
                .idle()
                .timeout(timeout)
                .keepalive(false)
                .wait_while(|_| false)?;
            Ok(match outcome {
                WaitOutcome::MailboxChanged => IdleOutcome::MailboxChanged,
                WaitOutcome::TimedOut => IdleOutcome::TimedOut,
            })
        })
        .await
    }

    async fn logout(&mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || session.logout()).await??;
        Ok(())
    }
}

fn imap_connect(login: &MailLogin) -> Result<ImapSession> {
    tracing::debug!(host = %login.host, port = login.port, "imap connect");
    let client = ClientBuilder::new(login.host.as_str(), login.port)
        .tls_kind(imap::TlsKind::Native)
        .mode(ConnectionMode::AutoTls)
        .danger_skip_tls_verify(login.skip_tls_verify)
        .connect()?;
    let session = client
        .login(&login.username, &login.password)
        .map_err(|e| e.0)?;
    tracing::debug!(host = %login.host, "imap login ok");
    Ok(session)
}

fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn flag_list(flags: &[MailFlag]) -> String {
    flags
        .iter()
        .map(|flag| flag.as_imap())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Server closed the connection on us; the session is unusable.
pub fn is_imap_bye(err: &anyhow::Error) -> bool {
    err.to_string().to_lowercase().contains("bye response")
}
