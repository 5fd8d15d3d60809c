use std::path::{Path, PathBuf};
use std::time::Duration;

use cozymail_mail::DEFAULT_IMAP_PORT;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ServiceConfig {
    pub(crate) storage: StorageConfig,
    pub(crate) watcher: WatcherConfig,
    pub(crate) imap: ImapSettings,
    pub(crate) supervisor: SupervisorConfig,
    pub(crate) notify: NotifyConfig,
    pub(crate) training: TrainingConfig,
    pub(crate) load_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StorageConfig {
    pub(crate) db_path: PathBuf,
    pub(crate) model_dir: PathBuf,
    pub(crate) log_dir: PathBuf,
    pub(crate) key_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WatcherConfig {
    pub(crate) inbox: String,
    pub(crate) idle_timeout: Duration,
    pub(crate) retry_backoff: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ImapSettings {
    pub(crate) default_port: u16,
    pub(crate) skip_tls_verify: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SupervisorConfig {
    pub(crate) max_restarts: u32,
    pub(crate) restart_backoff: Duration,
    pub(crate) restart_backoff_max: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NotifyConfig {
    pub(crate) endpoint: Option<String>,
    pub(crate) timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TrainingConfig {
    pub(crate) spam_limit: usize,
    pub(crate) ham_limit: usize,
    pub(crate) ham_whitelist: WhitelistScope,
}

/// What a message marked as ham adds to the user's whitelist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum WhitelistScope {
    /// The sender address.
    #[default]
    Address,
    /// `*@domain` of the sender.
    Domain,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            inbox: "INBOX".to_string(),
            idle_timeout: Duration::from_secs(300),
            retry_backoff: Duration::from_secs(10),
        }
    }
}

impl Default for ImapSettings {
    fn default() -> Self {
        Self {
            default_port: DEFAULT_IMAP_PORT,
            skip_tls_verify: false,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            restart_backoff: Duration::from_secs(5),
            restart_backoff_max: Duration::from_secs(300),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout: Duration::from_millis(2000),
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            spam_limit: 200,
            ham_limit: 500,
            ham_whitelist: WhitelistScope::Address,
        }
    }
}

impl StorageConfig {
    fn defaults(state_dir: &Path) -> Self {
        Self {
            db_path: state_dir.join("cozymail.db"),
            model_dir: state_dir.join("models"),
            log_dir: state_dir.join("logs"),
            key_file: state_dir.join("cozymail.key"),
        }
    }
}

impl ServiceConfig {
    fn defaults(state_dir: &Path) -> Self {
        Self {
            storage: StorageConfig::defaults(state_dir),
            watcher: WatcherConfig::default(),
            imap: ImapSettings::default(),
            supervisor: SupervisorConfig::default(),
            notify: NotifyConfig::default(),
            training: TrainingConfig::default(),
            load_error: None,
        }
    }
}

pub(crate) fn xdg_config_dir() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub(crate) fn state_dir() -> PathBuf {
    std::env::var_os("XDG_STATE_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local").join("state"))
        })
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("cozymail")
}

fn config_path_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("cozymail.toml"),
        xdg_config_dir().join("cozymail").join("cozymail.toml"),
    ]
}

fn load_config_text(explicit: Option<&Path>) -> Option<String> {
    if let Some(path) = explicit {
        return std::fs::read_to_string(path).ok();
    }
    for path in config_path_candidates() {
        if let Ok(content) = std::fs::read_to_string(&path) {
            return Some(content);
        }
    }
    None
}

pub(crate) fn load_service_config(explicit: Option<&Path>) -> ServiceConfig {
    let state_dir = state_dir();
    match load_config_text(explicit) {
        Some(content) => parse_service_config(&content, &state_dir),
        None => {
            let mut config = ServiceConfig::defaults(&state_dir);
            if let Some(path) = explicit {
                config.load_error = Some(format!("Cannot read {}", path.display()));
            }
            config
        }
    }
}

pub(crate) fn parse_service_config(content: &str, state_dir: &Path) -> ServiceConfig {
    let default = ServiceConfig::defaults(state_dir);
    let value: toml::Value = match toml::from_str(&content) {
        Ok(value) => value,
        Err(err) => {
            return ServiceConfig {
                load_error: Some(format!("Invalid cozymail.toml: {}", err)),
                ..default
            };
        }
    };
    ServiceConfig {
        storage: parse_storage(value.get("storage"), state_dir),
        watcher: parse_watcher(value.get("watcher")),
        imap: parse_imap(value.get("imap")),
        supervisor: parse_supervisor(value.get("supervisor")),
        notify: parse_notify(value.get("notify")),
        training: parse_training(value.get("training")),
        load_error: None,
    }
}

fn parse_storage(section: Option<&toml::Value>, state_dir: &Path) -> StorageConfig {
    let default = StorageConfig::defaults(state_dir);
    let Some(storage) = section else {
        return default;
    };
    let path = |key: &str, fallback: PathBuf| {
        storage
            .get(key)
            .and_then(|v| v.as_str())
            .map(|raw| resolve_path(raw, state_dir))
            .unwrap_or(fallback)
    };
    StorageConfig {
        db_path: path("db_path", default.db_path.clone()),
        model_dir: path("model_dir", default.model_dir.clone()),
        log_dir: path("log_dir", default.log_dir.clone()),
        key_file: path("key_file", default.key_file.clone()),
    }
}

fn parse_watcher(section: Option<&toml::Value>) -> WatcherConfig {
    let default = WatcherConfig::default();
    let Some(watcher) = section else {
        return default;
    };
    let inbox = watcher
        .get("inbox")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or(default.inbox);
    let idle_timeout = watcher
        .get("idle_timeout_secs")
        .and_then(|v| v.as_integer())
        .map(|v| Duration::from_secs(v.clamp(10, 29 * 60) as u64))
        .unwrap_or(default.idle_timeout);
    let retry_backoff = watcher
        .get("retry_backoff_secs")
        .and_then(|v| v.as_integer())
        .map(|v| Duration::from_secs(v.clamp(0, 3600) as u64))
        .unwrap_or(default.retry_backoff);
    WatcherConfig {
        inbox,
        idle_timeout,
        retry_backoff,
    }
}

fn parse_imap(section: Option<&toml::Value>) -> ImapSettings {
    let default = ImapSettings::default();
    let Some(imap) = section else {
        return default;
    };
    let default_port = imap
        .get("default_port")
        .and_then(|v| v.as_integer())
        .and_then(|v| u16::try_from(v).ok())
        .unwrap_or(default.default_port);
    let skip_tls_verify = imap
        .get("skip_tls_verify")
        .and_then(parse_bool)
        .unwrap_or(default.skip_tls_verify);
    ImapSettings {
        default_port,
        skip_tls_verify,
    }
}

fn parse_supervisor(section: Option<&toml::Value>) -> SupervisorConfig {
    let default = SupervisorConfig::default();
    let Some(supervisor) = section else {
        return default;
    };
    let max_restarts = supervisor
        .get("max_restarts")
        .and_then(|v| v.as_integer())
        .map(|v| v.clamp(0, u32::MAX as i64) as u32)
        .unwrap_or(default.max_restarts);
    let restart_backoff = supervisor
        .get("restart_backoff_secs")
        .and_then(|v| v.as_integer())
        .map(|v| Duration::from_secs(v.max(0) as u64))
        .unwrap_or(default.restart_backoff);
    let restart_backoff_max = supervisor
        .get("restart_backoff_max_secs")
        .and_then(|v| v.as_integer())
        .map(|v| Duration::from_secs(v.max(0) as u64))
        .unwrap_or(default.restart_backoff_max);
    SupervisorConfig {
        max_restarts,
        restart_backoff,
        restart_backoff_max: restart_backoff_max.max(restart_backoff),
    }
}

fn parse_notify(section: Option<&toml::Value>) -> NotifyConfig {
    let default = NotifyConfig::default();
    let Some(notify) = section else {
        return default;
    };
    let endpoint = notify
        .get("endpoint")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let timeout = notify
        .get("timeout_ms")
        .and_then(|v| v.as_integer())
        .map(|v| Duration::from_millis(v.clamp(100, 60_000) as u64))
        .unwrap_or(default.timeout);
    NotifyConfig { endpoint, timeout }
}

fn parse_training(section: Option<&toml::Value>) -> TrainingConfig {
    let default = TrainingConfig::default();
    let Some(training) = section else {
        return default;
    };
    let limit = |key: &str, fallback: usize| {
        training
            .get(key)
            .and_then(|v| v.as_integer())
            .map(|v| v.max(0) as usize)
            .unwrap_or(fallback)
    };
    TrainingConfig {
        spam_limit: limit("spam_limit", default.spam_limit),
        ham_limit: limit("ham_limit", default.ham_limit),
        ham_whitelist: match training.get("ham_whitelist_scope").and_then(|v| v.as_str()) {
            Some(scope) if scope.trim().eq_ignore_ascii_case("domain") => WhitelistScope::Domain,
            _ => default.ham_whitelist,
        },
    }
}

fn resolve_path(raw: &str, state_dir: &Path) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        state_dir.join(path)
    }
}

fn parse_bool(value: &toml::Value) -> Option<bool> {
    value.as_bool().or_else(|| {
        value
            .as_str()
            .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
    })
}

pub(crate) fn default_config_template() -> &'static str {
    r#"# cozymail configuration

[storage]
db_path = "cozymail.db"
model_dir = "models"
log_dir = "logs"
key_file = "cozymail.key"

[watcher]
inbox = "INBOX"
idle_timeout_secs = 300
retry_backoff_secs = 10

[imap]
default_port = 993
skip_tls_verify = false

[supervisor]
max_restarts = 5
restart_backoff_secs = 5
restart_backoff_max_secs = 300

[notify]
# endpoint = "http://localhost/notify"
timeout_ms = 2000

[training]
spam_limit = 200
ham_limit = 500
# "address" or "domain"
ham_whitelist_scope = "address"
"#
}
