use std::{env::var, time::Duration};

use anyhow::{Context, Result};
use broker::BrokerConfig;

pub const DEFAULT_WATCHLIST: &str = "NSE:NIFTYBEES,NSE:CPSEETF,NSE:ITBEES";
/// Weekdays at 15:45, after the NSE close.
pub const DEFAULT_CRON: &str = "0 45 15 * * Mon-Fri";
pub const DEFAULT_CONCURRENCY: usize = 1;
pub const DEFAULT_PAUSE_MS: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerConfig,
    pub watchlist: Vec<String>,
    pub cron: String,
    pub concurrency: usize,
    /// Sleep before each symbol after the first.
    pub pause: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let concurrency = match var("SCANNER_CONCURRENCY") {
            Ok(v) => v
                .trim()
                .parse::<usize>()
                .with_context(|| format!("SCANNER_CONCURRENCY is not a number: {v}"))?
                .max(1),
            Err(_) => DEFAULT_CONCURRENCY,
        };

        let pause_ms = match var("SCANNER_PAUSE_MS") {
            Ok(v) => v
                .trim()
                .parse::<u64>()
                .with_context(|| format!("SCANNER_PAUSE_MS is not a number: {v}"))?,
            Err(_) => DEFAULT_PAUSE_MS,
        };

        Ok(Self {
            broker: BrokerConfig::from_env(),
            watchlist: parse_watchlist(
                &var("SCANNER_WATCHLIST").unwrap_or_else(|_| DEFAULT_WATCHLIST.to_string()),
            ),
            cron: var("SCANNER_CRON").unwrap_or_else(|_| DEFAULT_CRON.to_string()),
            concurrency,
            pause: Duration::from_millis(pause_ms),
        })
    }
}

/// Comma-separated symbols, blanks dropped, first occurrence kept.
pub fn parse_watchlist(raw: &str) -> Vec<String> {
    let mut symbols: Vec<String> = Vec::new();
    for symbol in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !symbols.iter().any(|s| s.eq_ignore_ascii_case(symbol)) {
            symbols.push(symbol.to_string());
        }
    }
    symbols
}
