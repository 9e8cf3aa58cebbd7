use std::sync::Arc;

use anyhow::{Result, bail};
use chrono_tz::Asia::Kolkata;
use scanner::{Data, config::Config, daily, login};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    let data = Data::from_config(&config)?;

    match std::env::args().nth(1).as_deref() {
        Some("login") => return login::run(&data.session).await,
        Some("logout") => {
            data.session.logout().await;
            info!("logged out");
            return Ok(());
        }
        Some("status") => {
            login::print_status(&data.session).await;
            return Ok(());
        }
        Some("scan") => {
            daily::run_daily(
                data.calculator,
                data.session,
                config.watchlist,
                config.concurrency,
                config.pause,
                CancellationToken::new(),
            )
            .await?;
            return Ok(());
        }
        Some(other) => bail!("unknown command `{other}`, expected login, logout, status or scan"),
        None => {}
    }

    if !data.session.refresh_if_needed().await {
        warn!("no valid broker session yet, scheduled scans will fail until `scanner login` runs");
    }

    let shutdown = CancellationToken::new();
    let mut sched = JobScheduler::new().await?;

    let calculator_job = Arc::clone(&data.calculator);
    let session_job = Arc::clone(&data.session);
    let shutdown_job = shutdown.clone();
    let watchlist_job = config.watchlist.clone();
    let (concurrency, pause) = (config.concurrency, config.pause);

    sched
        .add(Job::new_async_tz(
            config.cron.as_str(),
            Kolkata,
            move |_uuid, _l| {
                let calculator = Arc::clone(&calculator_job);
                let session = Arc::clone(&session_job);
                let watchlist = watchlist_job.clone();
                let cancel = shutdown_job.clone();

                Box::pin(async move {
                    if let Err(e) =
                        daily::run_daily(calculator, session, watchlist, concurrency, pause, cancel)
                            .await
                    {
                        error!("run_daily failed: {e:?}");
                    }
                })
            },
        )?)
        .await?;

    sched.start().await?;
    info!(cron = %config.cron, "scheduler started");

    shutdown_signal().await;

    shutdown.cancel();
    sched.shutdown().await?;

    info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::{
            select,
            signal::unix::{SignalKind, signal},
        };
        let (Ok(mut sigterm), Ok(mut sigint)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) else {
            warn!("failed to install signal handlers, falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        };
        select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv()  => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
