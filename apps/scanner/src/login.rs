use std::{env::var, io::Write};

use anyhow::{Context, Result, ensure};
use broker::SessionManager;
use tokio::io::{AsyncBufReadExt, BufReader, stdin};
use tracing::{info, warn};

/// Two-step interactive login. Credentials come from the environment, the OTP from the operator.
pub async fn run(session: &SessionManager) -> Result<()> {
    let username = var("BROKER_USERNAME").context("BROKER_USERNAME not set")?;
    let password = var("BROKER_PASSWORD").context("BROKER_PASSWORD not set")?;
    let api_key = var("BROKER_API_KEY").context("BROKER_API_KEY not set")?;

    let login = session.login(&username, &password).await?;

    print!("OTP: ");
    std::io::stdout().flush()?;

    let otp = BufReader::new(stdin())
        .lines()
        .next_line()
        .await?
        .unwrap_or_default();
    let otp = otp.trim();
    ensure!(!otp.is_empty(), "no OTP entered");

    let outcome = session
        .exchange_session(&api_key, &login.intermediate_token, otp)
        .await?;

    if outcome.persisted {
        info!(expires_at = %outcome.expires_at, "session ready");
    } else {
        warn!(
            expires_at = %outcome.expires_at,
            "session ready but not saved, it will not survive a restart"
        );
    }

    Ok(())
}

pub async fn print_status(session: &SessionManager) {
    let status = session.status().await;

    match (status.logged_in, status.expires_at) {
        (true, Some(expires_at)) => println!(
            "logged in as {} until {expires_at}",
            status.username.as_deref().unwrap_or("<unknown>")
        ),
        (true, None) => println!("logged in, no expiry recorded"),
        (false, _) => println!("not logged in"),
    }
}
