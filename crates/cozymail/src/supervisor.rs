use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinSet;

use cozymail_core::Account;

use crate::config::SupervisorConfig;
use crate::services::Services;
use crate::watcher::{IdleWatcher, WatchError, sleep_or_shutdown};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccountExit {
    Stopped,
    Abandoned { failures: u32 },
}

/// `base * 2^(failure - 1)`, capped.
pub(crate) fn restart_delay(config: &SupervisorConfig, failure: u32) -> Duration {
    let factor = 1u32 << failure.saturating_sub(1).min(16);
    config
        .restart_backoff
        .saturating_mul(factor)
        .min(config.restart_backoff_max)
}

/// Keeps one task alive: restarts it after errors or panics with backoff,
/// gives up after `max_restarts` failures in a row. A run that lasted longer
/// than the backoff cap resets the count.
pub(crate) async fn supervise<F, Fut>(
    account_id: i64,
    config: &SupervisorConfig,
    mut shutdown: watch::Receiver<bool>,
    mut start: F,
) -> AccountExit
where
    F: FnMut(watch::Receiver<bool>) -> Fut,
    Fut: Future<Output = Result<(), WatchError>> + Send + 'static,
{
    let mut failures = 0u32;
    loop {
        let started = Instant::now();
        let outcome = tokio::spawn(start(shutdown.clone())).await;
        match outcome {
            Ok(Ok(())) => return AccountExit::Stopped,
            Ok(Err(err)) => {
                tracing::error!(account_id, error = %err, "watcher failed");
            }
            Err(err) if err.is_panic() => {
                tracing::error!(account_id, "watcher panicked");
            }
            Err(_) => return AccountExit::Stopped,
        }
        if *shutdown.borrow() {
            return AccountExit::Stopped;
        }
        if started.elapsed() >= config.restart_backoff_max {
            failures = 0;
        }
        failures += 1;
        if failures > config.max_restarts {
            tracing::error!(account_id, failures, "giving up on account");
            return AccountExit::Abandoned { failures };
        }
        let delay = restart_delay(config, failures);
        tracing::warn!(account_id, failures, delay_ms = delay.as_millis() as u64, "restarting watcher");
        if sleep_or_shutdown(delay, &mut shutdown).await {
            return AccountExit::Stopped;
        }
    }
}

/// One supervised watcher per account; returns when all of them are done.
pub(crate) async fn run_watchers(
    services: Arc<Services>,
    accounts: Vec<Account>,
    shutdown: watch::Receiver<bool>,
) -> Vec<(i64, AccountExit)> {
    let mut tasks = JoinSet::new();
    for account in accounts {
        let services = services.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let config = services.config.supervisor.clone();
            let exit = supervise(account.id, &config, shutdown, |rx| {
                let services = services.clone();
                let account_id = account.id;
                async move { IdleWatcher::new(services, account_id).run(rx).await }
            })
            .await;
            if let AccountExit::Abandoned { failures } = exit {
                services.log.error(
                    &account,
                    &format!("watcher abandoned after {} consecutive failures", failures),
                );
            }
            (account.id, exit)
        });
    }

    let mut exits = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(exit) => exits.push(exit),
            Err(err) => tracing::error!(error = %err, "supervisor task failed"),
        }
    }
    exits.sort_by_key(|(id, _)| *id);
    exits
}
