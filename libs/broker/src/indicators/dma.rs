//! 20-day moving average with a deterministic fallback estimate.
//!
//! Every [`Dma20`] carries its [`Method`]. A `Fallback` value is an approximation policy
//! anchored on the live price, never historical data, and callers must be able to tell.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Serialize;
use sha2::{Digest, Sha256};
use ta::Next;
use ta::indicators::SimpleMovingAverage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::{
    error::{BrokerError, Result},
    price_client::{Bar, PriceClient},
    symbol::base_symbol,
};

pub const DMA_PERIOD: usize = 20;
pub const HISTORY_WINDOW_DAYS: u32 = 30;

/// Identifies the hash-to-variation function below. Bump it if any constant changes.
pub const FALLBACK_ESTIMATOR_VERSION: &str = "sha256-v1";
pub const MAX_FALLBACK_DEVIATION: f64 = 0.15;
pub const FLAT_FALLBACK_FACTOR: f64 = 1.02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Historical,
    Fallback,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Historical => "historical",
            Method::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dma20 {
    pub symbol: String,
    pub value: f64,
    pub method: Method,
    /// Valid closes behind a historical value; 0 for a fallback.
    pub sample_size: usize,
    pub current_price: f64,
}

impl Dma20 {
    /// Signed distance of the live price from the average, in percent. Negative when below.
    pub fn percent_from_dma(&self) -> f64 {
        (self.current_price - self.value) / self.value * 100.0
    }
}

/// Mean of the last [`DMA_PERIOD`] closes, or `None` when there are fewer.
pub fn calculate(closes: &[f64]) -> Option<f64> {
    if closes.len() < DMA_PERIOD {
        return None;
    }

    let mut sma = SimpleMovingAverage::new(DMA_PERIOD).ok()?;
    closes[closes.len() - DMA_PERIOD..]
        .iter()
        .map(|&close| sma.next(close))
        .last()
}

const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%d-%m-%Y", "%d/%m/%Y", "%Y/%m/%d"];
const DATETIME_FORMATS: [&str; 3] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%d-%m-%Y %H:%M:%S",
];

/// Bar date as an instant. Accepts RFC 3339, the formats above and unix seconds or millis.
pub fn parse_bar_date(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    if let Some(dt) = DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
    {
        return Some(dt);
    }
    if let Some(date) = DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
    {
        return date.and_hms_opt(0, 0, 0);
    }

    let epoch: i64 = raw.parse().ok()?;
    let dt = if epoch.abs() >= 100_000_000_000 {
        DateTime::from_timestamp_millis(epoch)
    } else {
        DateTime::from_timestamp(epoch, 0)
    };
    dt.map(|dt| dt.naive_utc())
}

/// Valid closes in chronological order. Bars are sorted only when every date parses;
/// otherwise upstream order is trusted.
pub fn valid_closes(bars: &[Bar]) -> Vec<f64> {
    let dated: Option<Vec<(NaiveDateTime, &Bar)>> = bars
        .iter()
        .map(|bar| Some((parse_bar_date(bar.date.as_deref()?)?, bar)))
        .collect();

    match dated {
        Some(mut dated) => {
            dated.sort_by_key(|(date, _)| *date);
            dated.into_iter().filter_map(|(_, bar)| bar.close).collect()
        }
        None => bars.iter().filter_map(|bar| bar.close).collect(),
    }
}

/// Stable pseudo-random variation in `[-0.03, 0.03)` from the first four bytes of SHA-256.
pub fn hash_variation(base: &str) -> f64 {
    let digest = Sha256::digest(base.as_bytes());
    let h = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);

    (f64::from(h % 600) - 300.0) / 10_000.0
}

/// Fixed directional bias by coarse instrument category.
pub fn category_bias(base: &str) -> f64 {
    if base.contains("NIFTY") {
        0.005
    } else if base.contains("BANK") {
        0.003
    } else if base.contains("GOLD") || base.contains("SILVER") {
        0.002
    } else {
        0.001
    }
}

/// `price * (1 + adjustment)`, unless that is non-positive or strays more than
/// [`MAX_FALLBACK_DEVIATION`] from `price`, in which case `price * 1.02`.
pub fn bounded_estimate(price: f64, adjustment: f64) -> f64 {
    let estimate = price * (1.0 + adjustment);
    if estimate <= 0.0 || ((estimate - price) / price).abs() > MAX_FALLBACK_DEVIATION {
        return price * FLAT_FALLBACK_FACTOR;
    }
    estimate
}

pub fn fallback_estimate(symbol: &str, current_price: f64) -> f64 {
    let base = base_symbol(symbol);
    bounded_estimate(current_price, hash_variation(&base) + category_bias(&base))
}

#[derive(Clone)]
pub struct DmaCalculator {
    client: PriceClient,
}

impl DmaCalculator {
    pub fn new(client: PriceClient) -> Self {
        Self { client }
    }

    pub async fn compute_dma20(&self, symbol: &str) -> Result<Dma20> {
        self.compute_dma20_with(symbol, &CancellationToken::new())
            .await
    }

    /// Needs the live price first: without it not even the fallback can be anchored.
    #[instrument(name = "compute_dma20", skip(self, cancel))]
    pub async fn compute_dma20_with(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> Result<Dma20> {
        let quote = self.client.fetch_live_price_with(symbol, cancel).await?;

        match self
            .client
            .fetch_historical_with(symbol, HISTORY_WINDOW_DAYS, cancel)
            .await
        {
            Ok(series) => {
                let closes = valid_closes(&series.bars);
                if let Some(value) = calculate(&closes) {
                    info!(value, samples = closes.len(), "historical DMA20");
                    return Ok(Dma20 {
                        symbol: symbol.to_string(),
                        value,
                        method: Method::Historical,
                        sample_size: closes.len(),
                        current_price: quote.price,
                    });
                }
                debug!(valid = closes.len(), "not enough closes for DMA20");
            }
            Err(e) if e.is_auth() || e == BrokerError::Cancelled => return Err(e),
            Err(e) => debug!(error = %e, "historical data unavailable"),
        }

        let value = fallback_estimate(symbol, quote.price);
        info!(
            value,
            current_price = quote.price,
            estimator = FALLBACK_ESTIMATOR_VERSION,
            "fallback DMA20"
        );

        Ok(Dma20 {
            symbol: symbol.to_string(),
            value,
            method: Method::Fallback,
            sample_size: 0,
            current_price: quote.price,
        })
    }
}
