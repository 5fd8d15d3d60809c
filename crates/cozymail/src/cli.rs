use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Value as JsonValue, json};
use tokio::sync::watch;

use cozymail_core::Account;

use crate::config::{ServiceConfig, default_config_template, xdg_config_dir};
use crate::credentials::{CredentialStore, KeyFileCredentials};
use crate::services::{Services, open_cache};
use crate::supervisor::{AccountExit, run_watchers};
use crate::trainer::train_users;

pub(crate) const CLI_SCHEMA_VERSION: &str = "cozymail.cli.v1";

#[derive(Parser, Debug)]
#[command(name = "cozymail", version, about = "Mail ingestion and spam filtering service")]
pub(crate) struct Cli {
    /// Config file; defaults to ./cozymail.toml, then $XDG_CONFIG_HOME/cozymail/cozymail.toml
    #[arg(short = 'c', long = "config")]
    pub(crate) config: Option<PathBuf>,
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CliCommand {
    /// Watch every account until interrupted.
    Watch {
        #[arg(long)]
        account: Option<i64>,
    },
    /// Retrain spam models from the junk folders and inboxes.
    Train {
        #[arg(long)]
        account: Option<i64>,
    },
    /// Create the key file, config template and database.
    Init,
    /// Encrypt a mailbox password read from stdin.
    Encrypt,
}

pub(crate) fn output_ok(value: JsonValue) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string(&json!({
            "schema": CLI_SCHEMA_VERSION,
            "ok": true,
            "result": value
        }))?
    );
    Ok(())
}

pub(crate) fn output_error(message: &str) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string(&json!({
            "schema": CLI_SCHEMA_VERSION,
            "ok": false,
            "error": message
        }))?
    );
    Ok(())
}

pub(crate) fn run_cli(
    rt: &Arc<tokio::runtime::Runtime>,
    command: CliCommand,
    config: ServiceConfig,
    config_path: Option<&Path>,
) -> Result<()> {
    match command {
        CliCommand::Watch { account } => rt.block_on(watch_accounts(config, account)),
        CliCommand::Train { account } => rt.block_on(train(config, account)),
        CliCommand::Init => rt.block_on(init(config, config_path)),
        CliCommand::Encrypt => encrypt(&config),
    }
}

async fn selected_accounts(services: &Services, only: Option<i64>) -> Result<Vec<Account>> {
    let accounts = services.cache.list_accounts().await?;
    let accounts: Vec<Account> = match only {
        Some(id) => accounts.into_iter().filter(|a| a.id == id).collect(),
        None => accounts,
    };
    if accounts.is_empty() {
        anyhow::bail!(match only {
            Some(id) => format!("Account {} not found", id),
            None => "No accounts configured".to_string(),
        });
    }
    Ok(accounts)
}

async fn watch_accounts(config: ServiceConfig, only: Option<i64>) -> Result<()> {
    let services = Arc::new(Services::open(config).await?);
    let accounts = selected_accounts(&services, only).await?;
    tracing::info!(accounts = accounts.len(), "starting watchers");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let exits = run_watchers(services, accounts, shutdown_rx).await;
    let out: Vec<JsonValue> = exits
        .into_iter()
        .map(|(account_id, exit)| match exit {
            AccountExit::Stopped => json!({ "account_id": account_id, "status": "stopped" }),
            AccountExit::Abandoned { failures } => json!({
                "account_id": account_id,
                "status": "abandoned",
                "failures": failures
            }),
        })
        .collect();
    output_ok(json!({ "accounts": out }))
}

async fn train(config: ServiceConfig, only: Option<i64>) -> Result<()> {
    let services = Services::open(config).await?;
    let accounts = selected_accounts(&services, only).await?;
    let results = train_users(&services, accounts).await;
    output_ok(json!({ "users": results }))
}

async fn init(config: ServiceConfig, config_path: Option<&Path>) -> Result<()> {
    let config_file = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| xdg_config_dir().join("cozymail").join("cozymail.toml"));
    let wrote_config = if config_file.exists() {
        false
    } else {
        if let Some(parent) = config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&config_file, default_config_template())
            .with_context(|| format!("writing {}", config_file.display()))?;
        true
    };

    let key_file = &config.storage.key_file;
    let generated_key = if key_file.exists() {
        KeyFileCredentials::load(key_file)?;
        false
    } else {
        KeyFileCredentials::generate(key_file)?;
        true
    };

    std::fs::create_dir_all(&config.storage.model_dir)?;
    std::fs::create_dir_all(&config.storage.log_dir)?;
    open_cache(&config).await?;

    output_ok(json!({
        "config": config_file.display().to_string(),
        "config_written": wrote_config,
        "key_file": key_file.display().to_string(),
        "key_generated": generated_key,
        "database": config.storage.db_path.display().to_string(),
    }))
}

fn encrypt(config: &ServiceConfig) -> Result<()> {
    let credentials = KeyFileCredentials::load(&config.storage.key_file)
        .context("credential key missing; run `cozymail init` first")?;
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let password = input.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        anyhow::bail!("No password on stdin");
    }
    let token = credentials.encrypt(password)?;
    output_ok(json!({ "token": token }))
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, CliCommand};

    #[test]
    fn parses_subcommands_and_global_config() {
        let cli = Cli::parse_from(["cozymail", "--config", "/tmp/c.toml", "train", "--account", "4"]);
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("/tmp/c.toml")));
        assert!(matches!(cli.command, CliCommand::Train { account: Some(4) }));

        let cli = Cli::parse_from(["cozymail", "watch"]);
        assert!(matches!(cli.command, CliCommand::Watch { account: None }));
    }

    #[test]
    fn rejects_unknown_commands() {
        assert!(Cli::try_parse_from(["cozymail", "send"]).is_err());
    }
}
