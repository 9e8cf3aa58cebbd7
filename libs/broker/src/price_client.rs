use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Days, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::BrokerConfig,
    error::{BrokerError, Result},
    http::{HttpRequest, Transport},
    session::{ApiCredentials, SessionManager, VERSION_HEADER},
    symbol::{Candidate, HISTORY, QUOTE_TYPE_A, QUOTE_TYPE_B, base_symbol, candidates},
};

const QUOTE_TIMEOUT: Duration = Duration::from_secs(10);
const HISTORY_TIMEOUT: Duration = Duration::from_secs(10);
const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Field names a quote entry may carry its last traded price under.
const QUOTE_PRICE_FIELDS: [&str; 3] = ["last_price", "ltp", "price"];

/// Field names a daily bar may carry its close under, in priority order.
pub const CLOSE_FIELDS: [&str; 4] = ["close", "last_price", "ltp", "price"];

const DATE_FIELDS: [&str; 4] = ["date", "timestamp", "time", "t"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiVariant {
    TypeA,
    TypeB,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quote {
    /// Symbol as the caller asked for it.
    pub symbol: String,
    pub price: f64,
    pub symbol_variant_used: String,
    pub variant: ApiVariant,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bar {
    pub date: Option<String>,
    /// First positive value among [`CLOSE_FIELDS`], if any.
    pub close: Option<f64>,
}

impl Bar {
    pub fn from_value(value: &Value) -> Self {
        let date = DATE_FIELDS.iter().find_map(|field| match &value[*field] {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        let close = CLOSE_FIELDS
            .iter()
            .find_map(|field| positive_number(&value[*field]));

        Self { date, close }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoricalSeries {
    pub symbol: String,
    pub symbol_variant_used: String,
    pub bars: Vec<Bar>,
}

/// Market data over the held session. Cheap to clone; fetches for different symbols may run
/// concurrently and only read a credential snapshot.
#[derive(Clone)]
pub struct PriceClient {
    transport: Arc<dyn Transport>,
    session: Arc<SessionManager>,
}

impl PriceClient {
    pub fn new(transport: Arc<dyn Transport>, session: Arc<SessionManager>) -> Self {
        Self { transport, session }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    fn config(&self) -> &BrokerConfig {
        self.session.config()
    }

    pub async fn fetch_live_price(&self, symbol: &str) -> Result<Quote> {
        self.fetch_live_price_with(symbol, &CancellationToken::new())
            .await
    }

    /// Type A cascade, then type B, then one search-resolved retry.
    #[instrument(name = "fetch_live_price", skip(self, cancel))]
    pub async fn fetch_live_price_with(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> Result<Quote> {
        let credentials = self
            .session
            .credentials()
            .await
            .ok_or(BrokerError::NotAuthenticated)?;

        let mut target = base_symbol(symbol);
        if target.is_empty() {
            return Err(BrokerError::NotFound("empty symbol".into()));
        }
        let mut searched = false;

        loop {
            if let Some(quote) = self
                .quote_cascade(symbol, &target, &credentials, cancel)
                .await?
            {
                info!(
                    price = quote.price,
                    variant = ?quote.variant,
                    used = %quote.symbol_variant_used,
                    "price resolved"
                );
                return Ok(quote);
            }
            if searched {
                break;
            }
            searched = true;

            match self.search(&target, &credentials, cancel).await? {
                Some(found) if base_symbol(&found) != target => {
                    info!(%found, "retrying with search match");
                    target = base_symbol(&found);
                }
                _ => break,
            }
        }

        warn!("price not found");
        Err(BrokerError::NotFound(format!("price not found for {symbol}")))
    }

    async fn quote_cascade(
        &self,
        symbol: &str,
        target: &str,
        credentials: &ApiCredentials,
        cancel: &CancellationToken,
    ) -> Result<Option<Quote>> {
        for candidate in candidates(target, &QUOTE_TYPE_A) {
            let request = HttpRequest::get(self.config().type_a_url("instruments/quote/ltp"))
                .query("i", candidate.to_string())
                .header(VERSION_HEADER.0, VERSION_HEADER.1)
                .header("Authorization", credentials.token_header())
                .timeout(QUOTE_TIMEOUT);

            debug!(%candidate, "trying type A quote");
            if let Some(payload) = self.attempt(request, credentials, cancel).await? {
                match type_a_price(&payload, &candidate, target) {
                    Some(price) => {
                        return Ok(Some(quote(symbol, price, &candidate, ApiVariant::TypeA)));
                    }
                    None => debug!(%candidate, "no usable price in type A payload"),
                }
            }
        }

        if !self.config().enable_type_b {
            return Ok(None);
        }

        for candidate in candidates(target, &QUOTE_TYPE_B) {
            let Some(exchange) = candidate.exchange else {
                continue;
            };
            let request = HttpRequest::get(self.config().type_b_url("instruments/quote"))
                .header(VERSION_HEADER.0, VERSION_HEADER.1)
                .header("Authorization", credentials.bearer_header())
                .header("X-PrivateKey", credentials.api_key.as_str())
                .json(json!({
                    "mode": "LTP",
                    "exchangeTokens": { exchange.as_str(): [&candidate.token] },
                }))
                .timeout(QUOTE_TIMEOUT);

            debug!(%candidate, "trying type B quote");
            if let Some(payload) = self.attempt(request, credentials, cancel).await? {
                match type_b_price(&payload, &candidate) {
                    Some(price) => {
                        return Ok(Some(quote(symbol, price, &candidate, ApiVariant::TypeB)));
                    }
                    None => debug!(%candidate, "no usable price in type B payload"),
                }
            }
        }

        Ok(None)
    }

    async fn search(
        &self,
        target: &str,
        credentials: &ApiCredentials,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let request = HttpRequest::get(self.config().type_a_url("instruments/search"))
            .query("q", target)
            .header(VERSION_HEADER.0, VERSION_HEADER.1)
            .header("Authorization", credentials.token_header())
            .timeout(SEARCH_TIMEOUT);

        debug!("all candidates missed, searching instruments");
        let found = self
            .attempt(request, credentials, cancel)
            .await?
            .and_then(|payload| {
                payload["data"][0]["symbol"]
                    .as_str()
                    .filter(|s| !s.trim().is_empty())
                    .map(str::to_string)
            });

        Ok(found)
    }

    pub async fn fetch_historical(&self, symbol: &str, days: u32) -> Result<HistoricalSeries> {
        self.fetch_historical_with(symbol, days, &CancellationToken::new())
            .await
    }

    /// Daily bars for the last `days` days. Each candidate tries the single-symbol endpoint,
    /// then the multi-symbol one.
    #[instrument(name = "fetch_historical", skip(self, cancel))]
    pub async fn fetch_historical_with(
        &self,
        symbol: &str,
        days: u32,
        cancel: &CancellationToken,
    ) -> Result<HistoricalSeries> {
        let credentials = self
            .session
            .credentials()
            .await
            .ok_or(BrokerError::NotAuthenticated)?;

        if base_symbol(symbol).is_empty() {
            return Err(BrokerError::NotFound("empty symbol".into()));
        }

        let to = Utc::now().date_naive();
        let from = to
            .checked_sub_days(Days::new(u64::from(days)))
            .ok_or_else(|| {
                BrokerError::NotFound(format!("history window of {days} days is out of range"))
            })?;
        let from = from.format("%Y-%m-%d").to_string();
        let to = to.format("%Y-%m-%d").to_string();

        for candidate in candidates(symbol, &HISTORY) {
            let spelled = candidate.to_string();
            let bodies = [
                (
                    "instruments/history",
                    json!({ "symbol": spelled, "from": from, "to": to, "interval": "1D" }),
                ),
                (
                    "market/history",
                    json!({ "symbols": [spelled], "from": from, "to": to }),
                ),
            ];

            for (path, body) in bodies {
                let request = HttpRequest::post(self.config().type_a_url(path))
                    .header(VERSION_HEADER.0, VERSION_HEADER.1)
                    .header("Authorization", credentials.token_header())
                    .json(body)
                    .timeout(HISTORY_TIMEOUT);

                debug!(%candidate, path, "trying historical bars");
                let Some(payload) = self.attempt(request, &credentials, cancel).await? else {
                    continue;
                };
                if let Some(bars) = history_bars(&payload) {
                    info!(%candidate, path, bars = bars.len(), "historical bars resolved");
                    return Ok(HistoricalSeries {
                        symbol: symbol.to_string(),
                        symbol_variant_used: spelled,
                        bars,
                    });
                }
            }
        }

        warn!("historical data not found");
        Err(BrokerError::NotFound(format!(
            "historical data not found for {symbol}"
        )))
    }

    /// One upstream call inside a cascade. Misses come back as `Ok(None)`; a rejected token
    /// erases the session and aborts the cascade.
    async fn attempt(
        &self,
        request: HttpRequest,
        credentials: &ApiCredentials,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>> {
        if cancel.is_cancelled() {
            return Err(BrokerError::Cancelled);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
            response = self.transport.execute(request) => response,
        };

        match response {
            Ok(response) if response.is_unauthorized() => {
                self.session.invalidate(&credentials.access_token).await;
                Err(BrokerError::Auth(format!(
                    "access token rejected with status {}",
                    response.status
                )))
            }
            Ok(response) if response.is_success() => match response.json() {
                Ok(payload) => Ok(Some(payload)),
                Err(e) => {
                    debug!(error = %e, "unreadable payload");
                    Ok(None)
                }
            },
            Ok(response) => {
                debug!(status = response.status, "candidate missed");
                Ok(None)
            }
            Err(e) => {
                debug!(error = %e, "candidate failed");
                Ok(None)
            }
        }
    }
}

fn quote(symbol: &str, price: f64, candidate: &Candidate, variant: ApiVariant) -> Quote {
    Quote {
        symbol: symbol.to_string(),
        price,
        symbol_variant_used: candidate.to_string(),
        variant,
        timestamp: Utc::now(),
    }
}

/// Positive, finite number from a JSON number or numeric string.
pub(crate) fn positive_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;

    (number.is_finite() && number > 0.0).then_some(number)
}

/// `{"status": "success", "data": {"NSE:X-EQ": {"last_price": 1.0}}}`
fn type_a_price(payload: &Value, candidate: &Candidate, base: &str) -> Option<f64> {
    if payload["status"].as_str() != Some("success") {
        return None;
    }
    let data = payload["data"].as_object()?;

    [candidate.to_string(), format!("NSE:{base}"), base.to_string()]
        .iter()
        .filter_map(|key| data.get(key))
        .find_map(|entry| {
            QUOTE_PRICE_FIELDS
                .iter()
                .find_map(|field| positive_number(&entry[*field]))
        })
}

/// `{"status": "true", "data": {"fetched": [{"exchange": "NSE", "tradingSymbol": "X", "ltp": 1}]}}`
fn type_b_price(payload: &Value, candidate: &Candidate) -> Option<f64> {
    let ok = match &payload["status"] {
        Value::String(s) => s == "true" || s == "success",
        Value::Bool(b) => *b,
        _ => false,
    };
    if !ok {
        return None;
    }
    let exchange = candidate.exchange?.as_str();

    payload["data"]["fetched"]
        .as_array()?
        .iter()
        .filter(|item| item["exchange"].as_str() == Some(exchange))
        .filter(|item| {
            item["tradingSymbol"]
                .as_str()
                .is_some_and(|s| s.to_uppercase().starts_with(&candidate.token))
        })
        .find_map(|item| positive_number(&item["ltp"]))
}

fn history_bars(payload: &Value) -> Option<Vec<Bar>> {
    if payload["status"].as_str() != Some("success") {
        return None;
    }
    let data = payload["data"].as_array().filter(|d| !d.is_empty())?;

    Some(data.iter().map(Bar::from_value).collect())
}
